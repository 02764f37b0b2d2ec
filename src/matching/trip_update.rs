use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::{Corrected, backfill_vehicle_id, mark_added, mark_scheduled};
use crate::error::MatchError;
use crate::gtfs_rt::TripUpdate;
use crate::gtfs_rt::trip_update::stop_time_update::ScheduleRelationship as StopRelationship;
use crate::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
use crate::metrics::{STOP_TIME_UPDATE_FAILURES, STOP_TIME_UPDATE_SUCCESSES};
use crate::resolver::{Acceptance, MatchKind, ResolveRequest, ScheduleResolver, TripRef};
use crate::store::ScheduledStopTime;
use chrono::{DateTime, Utc};

/// Which event of a stop-time update a delay estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Arrival,
    Departure,
}

/// Trip-level delay taken from the first upcoming event that carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayEstimate {
    pub stop_time_update_idx: usize,
    pub kind: EventKind,
    pub delay: i32,
}

/// Finds the first stop-time update, in order, whose arrival (checked first)
/// or departure is after `now` (unix seconds) and has a delay.
pub fn estimate_delay(trip_update: &TripUpdate, now: i64) -> Option<DelayEstimate> {
    fn upcoming(ev: Option<&StopTimeEvent>, now: i64) -> Option<i32> {
        let ev = ev?;
        match (ev.time, ev.delay) {
            (Some(time), Some(delay)) if time > now => Some(delay),
            _ => None,
        }
    }

    trip_update
        .stop_time_update
        .iter()
        .enumerate()
        .find_map(|(idx, stu)| {
            if let Some(delay) = upcoming(stu.arrival.as_ref(), now) {
                return Some(DelayEstimate {
                    stop_time_update_idx: idx,
                    kind: EventKind::Arrival,
                    delay,
                });
            }
            upcoming(stu.departure.as_ref(), now).map(|delay| DelayEstimate {
                stop_time_update_idx: idx,
                kind: EventKind::Departure,
                delay,
            })
        })
}

/// Live minus scheduled, in seconds, if it fits the wire's 32-bit delay.
fn delay_seconds(live: i64, scheduled: DateTime<Utc>) -> Option<i32> {
    live.checked_sub(scheduled.timestamp())
        .and_then(|d| i32::try_from(d).ok())
}

fn apply_delay(event: Option<&mut StopTimeEvent>, scheduled: Option<DateTime<Utc>>) {
    let (Some(event), Some(scheduled)) = (event, scheduled) else {
        return;
    };
    let Some(time) = event.time else {
        return;
    };
    match delay_seconds(time, scheduled) {
        Some(delay) => event.delay = Some(delay),
        None => warn!(
            time,
            scheduled = scheduled.timestamp(),
            "Delay does not fit into 32 bits, leaving it unset"
        ),
    }
}

/// Index of the next unconsumed scheduled stop-time matching `stu`.
fn align(stu: &StopTimeUpdate, schedule: &[ScheduledStopTime], cursor: usize) -> Option<usize> {
    let stop_id = stu.stop_id.as_deref()?;
    schedule
        .iter()
        .enumerate()
        .skip(cursor)
        .find(|(_, st)| {
            let sequence_ok = stu
                .stop_sequence
                .is_none_or(|seq| seq == st.stop_sequence);
            sequence_ok && st.stop_id == stop_id
        })
        .map(|(idx, _)| idx)
}

pub struct TripUpdateMatcher {
    resolver: Arc<ScheduleResolver>,
}

impl TripUpdateMatcher {
    pub fn new(resolver: Arc<ScheduleResolver>) -> Self {
        Self { resolver }
    }

    /// Matches a trip update against the schedule.
    ///
    /// `now` (unix seconds) is only used to pick the upcoming event for the
    /// trip-level delay estimate.
    #[tracing::instrument(
        skip_all,
        fields(
            route_id = trip_update.trip.route_id.as_deref().unwrap_or_default(),
            trip_id = trip_update.trip.trip_id.as_deref().unwrap_or_default(),
        )
    )]
    pub async fn match_trip_update(
        &self,
        trip_update: &TripUpdate,
        now: i64,
    ) -> Result<Corrected<TripUpdate>, MatchError> {
        let trip = TripRef::from_descriptor(&trip_update.trip)?;
        let mut out = trip_update.clone();

        if out.stop_time_update.is_empty() {
            warn!("Cannot match TripUpdate, it has 0 StopTimeUpdates");
            mark_added(&mut out.trip);
            return Ok(Corrected::added(out));
        }

        let with_sequence = out
            .stop_time_update
            .iter()
            .find(|stu| stu.stop_id.is_some() && stu.stop_sequence.is_some());
        let representative = match with_sequence {
            Some(stu) => stu,
            None => {
                warn!(
                    "TripUpdate has no StopTimeUpdate with stop_id & stop_sequence, matching ambiguously"
                );
                match out.stop_time_update.iter().find(|stu| stu.stop_id.is_some()) {
                    Some(stu) => stu,
                    None => {
                        warn!("Cannot match TripUpdate, it has no StopTimeUpdate with stop_id");
                        mark_added(&mut out.trip);
                        return Ok(Corrected::added(out));
                    }
                }
            }
        };

        let outcome = self
            .resolver
            .resolve(&ResolveRequest {
                kind: MatchKind::TripUpdate,
                trip: &trip,
                stop_id: representative.stop_id.as_deref(),
                stop_sequence: representative.stop_sequence,
                acceptance: Acceptance::NonEmpty,
                match_limit: 1,
                fetch_trip: true,
            })
            .await?;

        let Some(scheduled_trip_id) = outcome.trip_id().map(str::to_string) else {
            warn!("Failed to find matching scheduled trip for TripUpdate, marking as ADDED");
            mark_added(&mut out.trip);
            return Ok(Corrected::added(out));
        };
        debug!(scheduled_trip_id = %scheduled_trip_id, "Found matching scheduled trip for TripUpdate");
        mark_scheduled(&mut out.trip, &scheduled_trip_id);

        let metrics = self.resolver.metrics();
        let labels = [
            ("schedule_feed_digest", self.resolver.digest_label()),
            ("route_id", trip.route_id.as_str()),
        ];

        let schedule = &outcome.stop_times;
        let mut cursor = 0;
        for (idx, stu) in out.stop_time_update.iter_mut().enumerate() {
            let Some(st_idx) = align(stu, schedule, cursor) else {
                metrics.inc_counter(STOP_TIME_UPDATE_FAILURES, &labels);
                warn!(
                    stop_time_update_idx = idx,
                    stop_id = stu.stop_id.as_deref().unwrap_or_default(),
                    "Failed to find matching scheduled stop_time for StopTimeUpdate"
                );
                continue;
            };
            let st = &schedule[st_idx];
            metrics.inc_counter(STOP_TIME_UPDATE_SUCCESSES, &labels);
            trace!(
                stop_time_update_idx = idx,
                stop_id = %st.stop_id,
                stop_sequence = st.stop_sequence,
                "Found matching scheduled stop_time"
            );

            stu.stop_sequence = Some(st.stop_sequence);
            stu.set_schedule_relationship(StopRelationship::Scheduled);
            apply_delay(stu.arrival.as_mut(), st.arrival);
            apply_delay(stu.departure.as_mut(), st.departure);

            cursor = st_idx + 1;
        }

        backfill_vehicle_id(&mut out.vehicle, &out.trip);

        if out.delay.is_none() {
            match estimate_delay(&out, now) {
                Some(estimate) => {
                    trace!(
                        stop_time_update_idx = estimate.stop_time_update_idx,
                        kind = ?estimate.kind,
                        delay = estimate.delay,
                        "Using upcoming event for TripUpdate.delay"
                    );
                    out.delay = Some(estimate.delay);
                }
                None => info!("No upcoming arrival/departure to use for TripUpdate.delay"),
            }
        }

        Ok(Corrected::matched(out))
    }
}
