//! Per-entity matchers.
//!
//! Each matcher takes a live entity by reference and returns a corrected copy;
//! the input is never mutated.

pub mod alert;
pub mod trip_update;
pub mod vehicle_position;

pub use alert::AlertMatcher;
pub use trip_update::{TripUpdateMatcher, estimate_delay};
pub use vehicle_position::VehiclePositionMatcher;

use crate::gtfs_rt::trip_descriptor::ScheduleRelationship;
use crate::gtfs_rt::{TripDescriptor, VehicleDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    /// Rewritten against a scheduled trip.
    Matched,
    /// No scheduled trip found, marked `ADDED`.
    Added,
    /// Nothing to match, passed through.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Corrected<T> {
    pub value: T,
    pub status: MatchStatus,
}

impl<T> Corrected<T> {
    pub fn matched(value: T) -> Self {
        Self {
            value,
            status: MatchStatus::Matched,
        }
    }

    pub fn added(value: T) -> Self {
        Self {
            value,
            status: MatchStatus::Added,
        }
    }

    pub fn unchanged(value: T) -> Self {
        Self {
            value,
            status: MatchStatus::Unchanged,
        }
    }
}

fn mark_added(trip: &mut TripDescriptor) {
    trip.set_schedule_relationship(ScheduleRelationship::Added);
}

fn mark_scheduled(trip: &mut TripDescriptor, scheduled_trip_id: &str) {
    trip.trip_id = Some(scheduled_trip_id.to_string());
    trip.set_schedule_relationship(ScheduleRelationship::Scheduled);
}

/// Fills `VehicleDescriptor.id` from the NYCT train id when it is missing.
pub fn backfill_vehicle_id(vehicle: &mut Option<VehicleDescriptor>, trip: &TripDescriptor) {
    let has_id = vehicle
        .as_ref()
        .and_then(|v| v.id.as_deref())
        .is_some_and(|id| !id.is_empty());
    if has_id {
        return;
    }
    let Some(train_id) = trip
        .nyct_trip_descriptor
        .as_ref()
        .and_then(|d| d.train_id.as_deref())
        .filter(|id| !id.is_empty())
    else {
        return;
    };
    vehicle.get_or_insert_with(VehicleDescriptor::default).id = Some(train_id.to_string());
}
