use std::sync::Arc;
use tracing::{debug, trace};

use super::{Corrected, MatchStatus};
use crate::error::MatchError;
use crate::gtfs_rt::Alert;
use crate::metrics::ALERTS_SKIPPED;
use crate::resolver::{Acceptance, MatchKind, ResolveRequest, ScheduleResolver, TripRef};

/// Rewrites trip ids of an alert's informed entities.
///
/// Only selectors whose trip descriptor carries route, trip id and an explicit
/// start date are resolved; no service date is inferred for the rest.
pub struct AlertMatcher {
    resolver: Arc<ScheduleResolver>,
}

impl AlertMatcher {
    pub fn new(resolver: Arc<ScheduleResolver>) -> Self {
        Self { resolver }
    }

    #[tracing::instrument(skip_all, fields(informed_entities = alert.informed_entity.len()))]
    pub async fn match_alert(&self, alert: &Alert) -> Result<Corrected<Alert>, MatchError> {
        let mut out = alert.clone();
        let mut rewritten = 0usize;

        for (idx, selector) in out.informed_entity.iter_mut().enumerate() {
            let Some(descriptor) = selector.trip.as_mut() else {
                trace!(entity_selector_idx = idx, "Skipping EntitySelector without trip");
                continue;
            };
            let Ok(trip) = TripRef::from_descriptor(descriptor) else {
                debug!(
                    entity_selector_idx = idx,
                    route_id = descriptor.route_id.as_deref().unwrap_or_default(),
                    trip_id = descriptor.trip_id.as_deref().unwrap_or_default(),
                    "Skipping EntitySelector without route_id, trip_id & start_date"
                );
                self.resolver.metrics().inc_counter(
                    ALERTS_SKIPPED,
                    &[
                        ("schedule_feed_digest", self.resolver.digest_label()),
                        ("route_id", descriptor.route_id.as_deref().unwrap_or_default()),
                    ],
                );
                continue;
            };

            let outcome = self
                .resolver
                .resolve(&ResolveRequest {
                    kind: MatchKind::Alert,
                    trip: &trip,
                    stop_id: None,
                    stop_sequence: None,
                    acceptance: Acceptance::NonEmpty,
                    match_limit: 1,
                    fetch_trip: false,
                })
                .await?;

            match outcome.trip_id() {
                Some(scheduled_trip_id) => {
                    debug!(
                        entity_selector_idx = idx,
                        scheduled_trip_id, "Found matching scheduled trip for EntitySelector"
                    );
                    descriptor.trip_id = Some(scheduled_trip_id.to_string());
                    rewritten += 1;
                }
                None => debug!(
                    entity_selector_idx = idx,
                    trip_id = %trip.trip_id,
                    "No matching scheduled trip for EntitySelector"
                ),
            }
        }

        let status = if rewritten > 0 {
            MatchStatus::Matched
        } else {
            MatchStatus::Unchanged
        };
        Ok(Corrected { value: out, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{EntitySelector, TripDescriptor};
    use crate::matching::test_support::{
        NYCT_LIVE_TRIP_ID, NYCT_SCHEDULED_TRIP_ID, nyct_schedule, resolver_with,
    };

    fn selector(trip: Option<TripDescriptor>) -> EntitySelector {
        EntitySelector {
            route_id: Some("1".to_string()),
            trip,
            ..Default::default()
        }
    }

    fn descriptor(start_date: Option<&str>) -> TripDescriptor {
        TripDescriptor {
            trip_id: Some(NYCT_LIVE_TRIP_ID.to_string()),
            route_id: Some("1".to_string()),
            start_date: start_date.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rewrites_dated_selectors_only() {
        let (resolver, metrics) = resolver_with(nyct_schedule(), "_");
        let matcher = AlertMatcher::new(resolver);
        let alert = Alert {
            informed_entity: vec![
                selector(None),
                selector(Some(descriptor(Some("20240320")))),
                selector(Some(descriptor(None))),
            ],
            ..Default::default()
        };

        let corrected = matcher.match_alert(&alert).await.unwrap();
        assert_eq!(corrected.status, MatchStatus::Matched);

        let entities = &corrected.value.informed_entity;
        assert_eq!(entities[0], alert.informed_entity[0]);
        assert_eq!(
            entities[1].trip.as_ref().and_then(|t| t.trip_id.as_deref()),
            Some(NYCT_SCHEDULED_TRIP_ID)
        );
        assert_eq!(entities[2], alert.informed_entity[2]);
        assert_eq!(metrics.counter_total("alerts_matching_skipped_total"), 1);
        assert_eq!(metrics.counter_total("alerts_matching_successes_total"), 1);
    }

    #[tokio::test]
    async fn test_unresolved_selector_is_left_alone() {
        let (resolver, _) = resolver_with(nyct_schedule(), "_");
        let matcher = AlertMatcher::new(resolver);
        let mut trip = descriptor(Some("20240321"));
        trip.trip_id = Some("999999_1..N03R".to_string());
        let alert = Alert {
            informed_entity: vec![selector(Some(trip))],
            ..Default::default()
        };

        let corrected = matcher.match_alert(&alert).await.unwrap();
        assert_eq!(corrected.status, MatchStatus::Unchanged);
        assert_eq!(corrected.value, alert);
    }
}
