use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gtfs_rt::FeedMessage;
use crate::matching::MatchStatus;

/// Per-snapshot summary of one reconciliation run, one CSV row each.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReconcileStats {
    pub timestamp: DateTime<Utc>,
    pub schedule_digest: String,
    pub feed_timestamp: Option<u64>,
    pub total_entities: usize,

    // entity types
    pub trip_updates: usize,
    pub vehicles: usize,
    pub alerts: usize,

    // matching
    pub matched_trip_updates: usize,
    pub added_trip_updates: usize,
    pub matched_vehicles: usize,
    pub added_vehicles: usize,
    pub matched_alerts: usize,
    pub errors: usize,

    // history & replacement
    pub restored: usize,
    pub stored: u64,
    pub canceled: usize,
    pub replacement_skipped: bool,

    pub matching_time_ms: u128,
}

/// Which kind of payload an entity carried when it was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    TripUpdate,
    VehiclePosition,
    Alert,
}

impl ReconcileStats {
    /// Counts entity types of the snapshot as received.
    pub fn from_feed(feed: &FeedMessage, schedule_digest: &str) -> Self {
        let mut s = ReconcileStats {
            timestamp: Utc::now(),
            schedule_digest: schedule_digest.to_string(),
            feed_timestamp: feed.header.timestamp,
            total_entities: feed.entity.len(),
            ..Default::default()
        };

        for e in &feed.entity {
            if e.trip_update.is_some() {
                s.trip_updates += 1;
            }

            if e.vehicle.is_some() {
                s.vehicles += 1;
            }

            if e.alert.is_some() {
                s.alerts += 1;
            }
        }

        s
    }

    pub fn record(&mut self, kind: EntityKind, status: MatchStatus) {
        match (kind, status) {
            (EntityKind::TripUpdate, MatchStatus::Matched) => self.matched_trip_updates += 1,
            (EntityKind::TripUpdate, MatchStatus::Added) => self.added_trip_updates += 1,
            (EntityKind::VehiclePosition, MatchStatus::Matched) => self.matched_vehicles += 1,
            (EntityKind::VehiclePosition, MatchStatus::Added) => self.added_vehicles += 1,
            (EntityKind::Alert, MatchStatus::Matched) => self.matched_alerts += 1,
            // alerts are never marked ADDED
            (EntityKind::Alert, MatchStatus::Added) => {}
            (
                EntityKind::TripUpdate | EntityKind::VehiclePosition | EntityKind::Alert,
                MatchStatus::Unchanged,
            ) => {}
        }
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    pub fn trip_update_match_pct(&self) -> f64 {
        Self::pct(self.matched_trip_updates, self.trip_updates)
    }
}
