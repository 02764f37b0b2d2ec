use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::{Corrected, backfill_vehicle_id, mark_added, mark_scheduled};
use crate::error::MatchError;
use crate::gtfs_rt::VehiclePosition;
use crate::resolver::{Acceptance, MatchKind, ResolveRequest, ScheduleResolver, TripRef};

pub struct VehiclePositionMatcher {
    resolver: Arc<ScheduleResolver>,
}

impl VehiclePositionMatcher {
    pub fn new(resolver: Arc<ScheduleResolver>) -> Self {
        Self { resolver }
    }

    /// Matches a vehicle position, requiring exactly one scheduled stop-time
    /// for its current stop.
    #[tracing::instrument(
        skip_all,
        fields(
            stop_id = vehicle_position.stop_id.as_deref().unwrap_or_default(),
            current_stop_sequence = vehicle_position.current_stop_sequence,
        )
    )]
    pub async fn match_vehicle_position(
        &self,
        vehicle_position: &VehiclePosition,
    ) -> Result<Corrected<VehiclePosition>, MatchError> {
        let Some(descriptor) = vehicle_position.trip.as_ref() else {
            trace!("VehiclePosition has no trip, passing through");
            return Ok(Corrected::unchanged(vehicle_position.clone()));
        };
        let trip = TripRef::from_descriptor(descriptor)?;

        let outcome = self
            .resolver
            .resolve(&ResolveRequest {
                kind: MatchKind::VehiclePosition,
                trip: &trip,
                stop_id: vehicle_position.stop_id.as_deref(),
                stop_sequence: vehicle_position.current_stop_sequence,
                acceptance: Acceptance::ExactlyOne,
                match_limit: 2,
                fetch_trip: false,
            })
            .await?;

        let mut out = vehicle_position.clone();
        let mut trip_descriptor = descriptor.clone();

        let Some(scheduled_trip_id) = outcome.trip_id().filter(|_| outcome.is_match()) else {
            warn!(
                route_id = %trip.route_id,
                trip_id = %trip.trip_id,
                "Failed to find a unique matching scheduled trip for VehiclePosition, marking as ADDED"
            );
            mark_added(&mut trip_descriptor);
            out.trip = Some(trip_descriptor);
            return Ok(Corrected::added(out));
        };
        debug!(
            route_id = %trip.route_id,
            scheduled_trip_id,
            "Found matching scheduled trip for VehiclePosition"
        );

        mark_scheduled(&mut trip_descriptor, scheduled_trip_id);
        backfill_vehicle_id(&mut out.vehicle, &trip_descriptor);
        out.trip = Some(trip_descriptor);

        Ok(Corrected::matched(out))
    }
}
