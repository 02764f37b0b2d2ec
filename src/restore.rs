//! Backfilling of stop-time updates the live feed intermittently drops.
//!
//! Every snapshot's arrival/departure per (trip, start date, stop) is
//! persisted; the next snapshot gets missing or stale events restored from
//! those rows before matching.

use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::StoreError;
use crate::gtfs_rt::trip_descriptor::ScheduleRelationship;
use crate::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
use crate::gtfs_rt::{FeedMessage, TripUpdate};
use crate::metrics::{
    MetricsSink, PREVIOUS_CLEAN_TIME, PREVIOUS_CLEANED, PREVIOUS_RESTORE_TIME,
    PREVIOUS_STORE_TIME, elapsed_seconds,
};
use crate::store::{PreviousStopTimeUpdate, StopTimeUpdateStore, parse_gtfs_date};

/// Delay before the first retention sweep after [`StopTimeUpdateHistory::spawn_cleanup`].
pub const CLEANUP_START_DELAY: Duration = Duration::from_millis(100);

type TripKey = (String, NaiveDate);

fn trip_key(tu: &TripUpdate) -> Option<TripKey> {
    let trip_id = tu.trip.trip_id.as_deref().filter(|id| !id.is_empty())?;
    let date = parse_gtfs_date(tu.trip.start_date.as_deref()?)?;
    Some((trip_id.to_string(), date))
}

/// The trip update's own timestamp, else the feed header's.
fn update_timestamp(tu: &TripUpdate, header_timestamp: Option<u64>) -> Option<i64> {
    tu.timestamp
        .or(header_timestamp)
        .and_then(|ts| i64::try_from(ts).ok())
}

/// Time if present, otherwise delay.
fn observed(ev: Option<&StopTimeEvent>) -> (Option<i64>, Option<i32>) {
    match ev {
        Some(StopTimeEvent { time: Some(t), .. }) => (Some(*t), None),
        Some(StopTimeEvent { delay, .. }) => (None, *delay),
        None => (None, None),
    }
}

fn time_event(time: i64) -> StopTimeEvent {
    StopTimeEvent {
        time: Some(time),
        ..Default::default()
    }
}

/// Rows to persist for every stop-time update of `feed`, one per key.
///
/// When a key appears more than once the row with the newest timestamp wins,
/// later entities breaking ties.
pub fn collect_observations(feed: &FeedMessage) -> Vec<PreviousStopTimeUpdate> {
    let mut rows: BTreeMap<(String, NaiveDate, String), PreviousStopTimeUpdate> = BTreeMap::new();

    for tu in feed.entity.iter().filter_map(|e| e.trip_update.as_ref()) {
        let Some((trip_id, start_date)) = trip_key(tu) else {
            continue;
        };
        let Some(timestamp) = update_timestamp(tu, feed.header.timestamp) else {
            trace!(trip_id = %trip_id, "TripUpdate has no timestamp, not storing its StopTimeUpdates");
            continue;
        };

        for stu in &tu.stop_time_update {
            let Some(stop_id) = stu.stop_id.as_deref().filter(|s| !s.is_empty()) else {
                continue;
            };
            let (arrival_time, arrival_delay) = observed(stu.arrival.as_ref());
            let (departure_time, departure_delay) = observed(stu.departure.as_ref());
            let row = PreviousStopTimeUpdate {
                trip_id: trip_id.clone(),
                start_date,
                stop_id: stop_id.to_string(),
                timestamp,
                arrival_time,
                arrival_delay,
                departure_time,
                departure_delay,
            };
            let key = (trip_id.clone(), start_date, stop_id.to_string());
            match rows.get(&key) {
                Some(prev) if prev.timestamp > timestamp => {}
                _ => {
                    rows.insert(key, row);
                }
            }
        }
    }

    rows.into_values().collect()
}

fn restore_event(
    ev: &mut Option<StopTimeEvent>,
    stored_time: Option<i64>,
    update_ts: Option<i64>,
    stored_ts: i64,
) -> bool {
    let Some(time) = stored_time else {
        return false;
    };
    let has_time = ev.as_ref().is_some_and(|e| e.time.is_some());
    let stale = update_ts.is_some_and(|ts| ts < stored_ts);
    if has_time && !stale {
        return false;
    }
    *ev = Some(time_event(time));
    true
}

/// Restores arrival and departure of one stop-time update from a stored row.
///
/// An event missing or without a time is replaced by the stored time; one
/// that has a time only when the stored row is newer than `update_ts`.
pub fn restore_stop_time_update(
    stu: &mut StopTimeUpdate,
    update_ts: Option<i64>,
    prev: &PreviousStopTimeUpdate,
) -> bool {
    let arrival = restore_event(&mut stu.arrival, prev.arrival_time, update_ts, prev.timestamp);
    let departure = restore_event(
        &mut stu.departure,
        prev.departure_time,
        update_ts,
        prev.timestamp,
    );
    arrival || departure
}

/// Stop-time updates rebuilt from stored rows, ordered by stored time.
fn rebuilt_stop_time_updates(rows: &[PreviousStopTimeUpdate]) -> Vec<StopTimeUpdate> {
    let mut timed: Vec<&PreviousStopTimeUpdate> = rows
        .iter()
        .filter(|r| r.arrival_time.is_some() || r.departure_time.is_some())
        .collect();
    timed.sort_by_key(|r| r.arrival_time.or(r.departure_time));

    timed
        .into_iter()
        .map(|r| StopTimeUpdate {
            stop_id: Some(r.stop_id.clone()),
            arrival: r.arrival_time.map(time_event),
            departure: r.departure_time.map(time_event),
            ..Default::default()
        })
        .collect()
}

pub struct StopTimeUpdateHistory {
    store: Arc<dyn StopTimeUpdateStore>,
    metrics: Arc<dyn MetricsSink>,
    digest_label: String,
    max_age: Duration,
}

impl StopTimeUpdateHistory {
    pub fn new(
        store: Arc<dyn StopTimeUpdateStore>,
        metrics: Arc<dyn MetricsSink>,
        digest_label: String,
        max_age: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            digest_label,
            max_age,
        }
    }

    fn labels(&self) -> [(&str, &str); 1] {
        [("schedule_feed_digest", self.digest_label.as_str())]
    }

    /// Upserts `rows`, returning how many were written.
    #[tracing::instrument(skip_all, fields(rows = rows.len()))]
    pub async fn store(&self, rows: &[PreviousStopTimeUpdate]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let t0 = Instant::now();
        let written = self.store.upsert(rows).await?;
        let query_time = elapsed_seconds(t0);
        self.metrics
            .observe_seconds(PREVIOUS_STORE_TIME, &self.labels(), query_time);
        debug!(written, query_time, "Stored StopTimeUpdates");
        Ok(written)
    }

    /// Restores stop-time updates of every trip update in `feed` from stored
    /// rows. Returns the number of stop-time updates changed or added.
    #[tracing::instrument(skip_all, fields(entities = feed.entity.len()))]
    pub async fn restore(&self, feed: &mut FeedMessage) -> Result<usize, StoreError> {
        let mut trips: Vec<TripKey> = feed
            .entity
            .iter()
            .filter_map(|e| e.trip_update.as_ref())
            .filter_map(trip_key)
            .collect();
        trips.sort();
        trips.dedup();
        if trips.is_empty() {
            return Ok(0);
        }

        let t0 = Instant::now();
        let rows = self.store.fetch_for_trips(&trips).await?;
        let query_time = elapsed_seconds(t0);
        self.metrics
            .observe_seconds(PREVIOUS_RESTORE_TIME, &self.labels(), query_time);
        debug!(
            trips = trips.len(),
            rows = rows.len(),
            query_time,
            "Fetched previous StopTimeUpdates"
        );

        let mut by_trip: HashMap<TripKey, Vec<PreviousStopTimeUpdate>> = HashMap::new();
        for row in rows {
            by_trip
                .entry((row.trip_id.clone(), row.start_date))
                .or_default()
                .push(row);
        }

        let header_timestamp = feed.header.timestamp;
        let mut restored = 0;
        for tu in feed.entity.iter_mut().filter_map(|e| e.trip_update.as_mut()) {
            let Some(key) = trip_key(tu) else {
                continue;
            };
            let Some(prev_rows) = by_trip.get(&key) else {
                continue;
            };

            if tu.stop_time_update.is_empty() {
                if tu.trip.schedule_relationship() != ScheduleRelationship::Scheduled {
                    warn!(
                        trip_id = %key.0,
                        schedule_relationship = tu.trip.schedule_relationship().as_str_name(),
                        "TripUpdate without StopTimeUpdates is not SCHEDULED, not restoring"
                    );
                    continue;
                }
                let rebuilt = rebuilt_stop_time_updates(prev_rows);
                trace!(trip_id = %key.0, n = rebuilt.len(), "Restoring all StopTimeUpdates");
                restored += rebuilt.len();
                tu.stop_time_update = rebuilt;
                continue;
            }

            let update_ts = update_timestamp(tu, header_timestamp);
            for stu in tu.stop_time_update.iter_mut() {
                let Some(stop_id) = stu.stop_id.as_deref() else {
                    continue;
                };
                let Some(prev) = prev_rows.iter().find(|r| r.stop_id == stop_id) else {
                    continue;
                };
                if restore_stop_time_update(stu, update_ts, prev) {
                    restored += 1;
                }
            }
        }

        debug!(restored, "Restored StopTimeUpdates");
        Ok(restored)
    }

    /// Deletes stored rows older than the retention horizon, relative to
    /// `now` (unix seconds).
    #[tracing::instrument(skip_all, fields(schedule_digest = %self.digest_label))]
    pub async fn clean(&self, now: i64) -> Result<u64, StoreError> {
        let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(max_age);

        let t0 = Instant::now();
        let deleted = self.store.delete_older_than(cutoff).await?;
        let query_time = elapsed_seconds(t0);
        let labels = self.labels();
        self.metrics
            .observe_seconds(PREVIOUS_CLEAN_TIME, &labels, query_time);
        self.metrics.set_gauge(PREVIOUS_CLEANED, &labels, deleted as f64);
        info!(deleted, cutoff, query_time, "Cleaned previous StopTimeUpdates");
        Ok(deleted)
    }

    /// Runs [`clean`](Self::clean) shortly after start and then every
    /// `interval` on its own task until the handle is stopped or dropped.
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration) -> CleanupHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + CLEANUP_START_DELAY;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.clean(Utc::now().timestamp()).await {
                            warn!(error = %e, "Failed to clean previous StopTimeUpdates");
                        }
                    }
                }
            }
            debug!("Stopped StopTimeUpdates cleanup");
        });
        CleanupHandle {
            stop: stop_tx,
            task,
        }
    }
}

/// Handle of the retention sweep task. Dropping it stops the sweep.
pub struct CleanupHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "StopTimeUpdates cleanup task failed");
        }
    }
}
