//! Trip replacement periods.
//!
//! The NYCT feed header declares, per route, a window during which the live
//! feed lists every running trip. Scheduled trips inside that window with no
//! live counterpart are presumed canceled and get a synthesized `CANCELED`
//! trip update.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::StoreError;
use crate::gtfs_rt::trip_descriptor::ScheduleRelationship;
use crate::gtfs_rt::{FeedEntity, FeedHeader, FeedMessage, TripDescriptor, TripUpdate};
use crate::metrics::{MetricsSink, REPLACEMENT_CANCELED, REPLACEMENT_QUERY_TIME, elapsed_seconds};
use crate::store::{CanceledTrip, ReplacementWindow, ScheduleStore, format_gtfs_date};

/// Results at or above this count disable the step for the snapshot.
pub const REPLACEMENT_QUERY_LIMIT: usize = 1000;

/// Window bound used when a period omits `start` or `end`.
pub const DEFAULT_HALF_WINDOW_SECONDS: i64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementOutcome {
    /// This many canceled trip updates were prepended.
    Applied(usize),
    /// The query hit [`REPLACEMENT_QUERY_LIMIT`]; nothing was changed.
    OverLimit,
    /// The snapshot has no header timestamp or no NYCT header.
    Inactive,
}

fn instant(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Per-route windows declared in the snapshot header, sorted by route id.
///
/// Returns `None` when the header has no timestamp or no NYCT extension.
pub fn replacement_windows(header: &FeedHeader) -> Option<Vec<ReplacementWindow>> {
    let t_ref = i64::try_from(header.timestamp?).ok()?;
    let nyct = header.nyct_feed_header.as_ref()?;

    let bound = |value: Option<u64>, fallback: i64| -> i64 {
        value
            .filter(|v| *v > 0)
            .and_then(|v| i64::try_from(v).ok())
            .unwrap_or(fallback)
    };

    // route_id -> window, later periods for the same route win
    let mut by_route: BTreeMap<String, ReplacementWindow> = BTreeMap::new();
    for period in &nyct.trip_replacement_period {
        let Some(route_id) = period.route_id.as_deref().filter(|r| !r.is_empty()) else {
            trace!("Skipping TripReplacementPeriod without route_id");
            continue;
        };
        let range = period.replacement_period.as_ref();
        let start = bound(
            range.and_then(|r| r.start),
            t_ref - DEFAULT_HALF_WINDOW_SECONDS,
        );
        let end = bound(range.and_then(|r| r.end), t_ref + DEFAULT_HALF_WINDOW_SECONDS);
        let (Some(start), Some(end)) = (instant(start), instant(end)) else {
            continue;
        };
        by_route.insert(
            route_id.to_string(),
            ReplacementWindow {
                route_id: route_id.to_string(),
                start,
                end,
            },
        );
    }
    Some(by_route.into_values().collect())
}

fn referenced_trip_ids(feed: &FeedMessage) -> Vec<String> {
    let ids: BTreeSet<&str> = feed
        .entity
        .iter()
        .flat_map(|e| {
            [
                e.trip_update.as_ref().and_then(|tu| tu.trip.trip_id.as_deref()),
                e.vehicle
                    .as_ref()
                    .and_then(|v| v.trip.as_ref())
                    .and_then(|t| t.trip_id.as_deref()),
            ]
        })
        .flatten()
        .filter(|id| !id.is_empty())
        .collect();
    ids.into_iter().map(str::to_string).collect()
}

/// The synthesized entity for a canceled scheduled trip.
pub fn canceled_entity(trip: &CanceledTrip) -> FeedEntity {
    let start_date = format_gtfs_date(trip.date);
    let mut descriptor = TripDescriptor {
        trip_id: Some(trip.trip_id.clone()),
        route_id: Some(trip.route_id.clone()),
        start_date: Some(start_date.clone()),
        start_time: trip.start_time.clone(),
        ..Default::default()
    };
    descriptor.set_schedule_relationship(ScheduleRelationship::Canceled);

    FeedEntity {
        id: format!("canceled-{start_date}-{}", trip.trip_id),
        trip_update: Some(TripUpdate {
            trip: descriptor,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub struct TripReplacementEngine {
    store: Arc<dyn ScheduleStore>,
    metrics: Arc<dyn MetricsSink>,
    digest_label: String,
}

impl TripReplacementEngine {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        metrics: Arc<dyn MetricsSink>,
        digest_label: String,
    ) -> Self {
        Self {
            store,
            metrics,
            digest_label,
        }
    }

    /// Prepends a `CANCELED` trip update for every scheduled trip inside a
    /// replacement window that the snapshot does not mention.
    #[tracing::instrument(skip_all, fields(schedule_digest = %self.digest_label))]
    pub async fn apply(&self, feed: &mut FeedMessage) -> Result<ReplacementOutcome, StoreError> {
        let Some(windows) = replacement_windows(&feed.header) else {
            debug!("No header timestamp or NYCT header, not applying TripReplacementPeriods");
            return Ok(ReplacementOutcome::Inactive);
        };
        if windows.is_empty() {
            return Ok(ReplacementOutcome::Applied(0));
        }

        let exclude = referenced_trip_ids(feed);
        trace!(
            excluded = exclude.len(),
            "Not replacing trip IDs already present in the feed"
        );

        let t0 = Instant::now();
        let mut canceled = self
            .store
            .trips_within_windows(&windows, &exclude, REPLACEMENT_QUERY_LIMIT)
            .await?;
        let query_time = elapsed_seconds(t0);
        self.metrics
            .observe_seconds(REPLACEMENT_QUERY_TIME, &[], query_time);
        debug!(query_time, rows = canceled.len(), "Queried TripReplacementPeriods");

        if canceled.len() >= REPLACEMENT_QUERY_LIMIT {
            warn!(
                limit = REPLACEMENT_QUERY_LIMIT,
                "TripReplacementPeriods query hit its limit, not applying them"
            );
            return Ok(ReplacementOutcome::OverLimit);
        }

        let mut counts: HashMap<&str, usize> = windows
            .iter()
            .map(|w| (w.route_id.as_str(), 0))
            .collect();
        for trip in &canceled {
            *counts.entry(trip.route_id.as_str()).or_insert(0) += 1;
        }
        for (route_id, count) in &counts {
            self.metrics
                .set_gauge(REPLACEMENT_CANCELED, &[("route_id", route_id)], *count as f64);
        }

        canceled.sort_by(|a, b| {
            (&a.route_id, &a.trip_id, a.date).cmp(&(&b.route_id, &b.trip_id, b.date))
        });
        let n = canceled.len();
        let entities: Vec<FeedEntity> = canceled.iter().map(canceled_entity).collect();
        feed.entity.splice(0..0, entities);

        debug!(canceled = n, "Applied TripReplacementPeriods");
        Ok(ReplacementOutcome::Applied(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{NyctFeedHeader, TimeRange, TripReplacementPeriod, VehiclePosition};
    use crate::metrics::MetricsRegistry;
    use crate::store::{MemoryScheduleStore, ScheduledStopTime};
    use chrono::NaiveDate;

    const T_REF: u64 = 1710953000;

    fn header(periods: Vec<TripReplacementPeriod>) -> FeedHeader {
        FeedHeader {
            gtfs_realtime_version: "1.0".to_string(),
            timestamp: Some(T_REF),
            nyct_feed_header: Some(NyctFeedHeader {
                nyct_subway_version: "1.0".to_string(),
                trip_replacement_period: periods,
            }),
            ..Default::default()
        }
    }

    fn period(route_id: &str, start: Option<u64>, end: Option<u64>) -> TripReplacementPeriod {
        TripReplacementPeriod {
            route_id: Some(route_id.to_string()),
            replacement_period: Some(TimeRange { start, end }),
        }
    }

    fn scheduled(route_id: &str, trip_id: &str, offset: i64) -> ScheduledStopTime {
        ScheduledStopTime {
            route_id: route_id.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
            trip_id: trip_id.to_string(),
            stop_id: "101N".to_string(),
            stop_sequence: 1,
            arrival: DateTime::from_timestamp(T_REF as i64 + offset, 0),
            departure: DateTime::from_timestamp(T_REF as i64 + offset, 0),
            trip_start_time: Some("07:23:30".to_string()),
        }
    }

    fn engine(rows: Vec<ScheduledStopTime>) -> (TripReplacementEngine, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let engine = TripReplacementEngine::new(
            Arc::new(MemoryScheduleStore::new(rows)),
            metrics.clone(),
            "abcdef01".to_string(),
        );
        (engine, metrics)
    }

    fn live_entity(id: &str, trip_id: &str) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            trip_update: Some(TripUpdate {
                trip: TripDescriptor {
                    trip_id: Some(trip_id.to_string()),
                    route_id: Some("1".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_windows_default_bounds() {
        let windows = replacement_windows(&header(vec![
            period("1", None, Some(T_REF + 600)),
            period("2", Some(0), None),
        ]))
        .unwrap();

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].route_id, "1");
        assert_eq!(windows[0].start.timestamp(), T_REF as i64 - 1800);
        assert_eq!(windows[0].end.timestamp(), T_REF as i64 + 600);
        assert_eq!(windows[1].start.timestamp(), T_REF as i64 - 1800);
        assert_eq!(windows[1].end.timestamp(), T_REF as i64 + 1800);
    }

    #[test]
    fn test_windows_require_timestamp_and_nyct_header() {
        let mut h = header(vec![]);
        h.timestamp = None;
        assert!(replacement_windows(&h).is_none());

        let mut h = header(vec![]);
        h.nyct_feed_header = None;
        assert!(replacement_windows(&h).is_none());
    }

    #[test]
    fn test_canceled_entity_shape() {
        let entity = canceled_entity(&CanceledTrip {
            route_id: "1".to_string(),
            trip_id: "AFA23GEN-1092-Weekday-00_072350_1..N03R".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            start_time: Some("12:03:30".to_string()),
        });
        assert_eq!(entity.id, "canceled-20240305-AFA23GEN-1092-Weekday-00_072350_1..N03R");
        let tu = entity.trip_update.unwrap();
        assert_eq!(tu.trip.schedule_relationship(), ScheduleRelationship::Canceled);
        assert_eq!(tu.trip.start_date.as_deref(), Some("20240305"));
        assert_eq!(tu.trip.start_time.as_deref(), Some("12:03:30"));
        assert!(tu.stop_time_update.is_empty());
    }

    #[tokio::test]
    async fn test_apply_prepends_sorted_cancellations() {
        let (engine, metrics) = engine(vec![
            scheduled("1", "B_trip", 60),
            scheduled("1", "A_trip", 120),
            scheduled("1", "live_trip", 180),
            scheduled("1", "far_future", 7200),
            scheduled("2", "other_route", 60),
        ]);
        let mut feed = FeedMessage {
            header: header(vec![period("1", None, None)]),
            entity: vec![live_entity("e1", "live_trip"), live_entity("e2", "unknown")],
        };

        let outcome = engine.apply(&mut feed).await.unwrap();
        assert_eq!(outcome, ReplacementOutcome::Applied(2));

        let ids: Vec<&str> = feed.entity.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["canceled-20240320-A_trip", "canceled-20240320-B_trip", "e1", "e2"]
        );
        assert_eq!(metrics.gauge(REPLACEMENT_CANCELED, &[("route_id", "1")]), Some(2.0));
        assert_eq!(metrics.summary_count_total(REPLACEMENT_QUERY_TIME), 1);
    }

    #[tokio::test]
    async fn test_vehicle_trip_ids_are_excluded() {
        let (engine, metrics) = engine(vec![scheduled("1", "A_trip", 60)]);
        let mut feed = FeedMessage {
            header: header(vec![period("1", None, None)]),
            entity: vec![FeedEntity {
                id: "v1".to_string(),
                vehicle: Some(VehiclePosition {
                    trip: Some(TripDescriptor {
                        trip_id: Some("A_trip".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
        };

        assert_eq!(engine.apply(&mut feed).await.unwrap(), ReplacementOutcome::Applied(0));
        assert_eq!(feed.entity.len(), 1);
        assert_eq!(metrics.gauge(REPLACEMENT_CANCELED, &[("route_id", "1")]), Some(0.0));
    }

    #[tokio::test]
    async fn test_over_limit_skips_step() {
        let rows: Vec<_> = (0..REPLACEMENT_QUERY_LIMIT)
            .map(|i| scheduled("1", &format!("trip_{i:04}"), 60))
            .collect();
        let (engine, _) = engine(rows);
        let mut feed = FeedMessage {
            header: header(vec![period("1", None, None)]),
            entity: vec![live_entity("e1", "live")],
        };

        assert_eq!(engine.apply(&mut feed).await.unwrap(), ReplacementOutcome::OverLimit);
        assert_eq!(feed.entity.len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_without_nyct_header() {
        let (engine, metrics) = engine(vec![scheduled("1", "A_trip", 60)]);
        let mut feed = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                timestamp: Some(T_REF),
                ..Default::default()
            },
            entity: vec![],
        };

        assert_eq!(engine.apply(&mut feed).await.unwrap(), ReplacementOutcome::Inactive);
        assert!(feed.entity.is_empty());
        assert_eq!(metrics.summary_count_total(REPLACEMENT_QUERY_TIME), 0);
    }
}
