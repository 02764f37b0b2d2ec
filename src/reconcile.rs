//! Drives one feed snapshot through restore, matching, store and trip
//! replacement.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::MatcherConfig;
use crate::error::MatchError;
use crate::gtfs_rt::{FeedEntity, FeedMessage};
use crate::matching::{AlertMatcher, MatchStatus, TripUpdateMatcher, VehiclePositionMatcher};
use crate::metrics::{FEED_ENTITY_ERRORS, FEED_MATCHING_TIME, MetricsSink, elapsed_seconds};
use crate::replacement::{ReplacementOutcome, TripReplacementEngine};
use crate::resolver::ScheduleResolver;
use crate::restore::{StopTimeUpdateHistory, collect_observations};
use crate::stats::{EntityKind, ReconcileStats};
use crate::store::{ScheduleStore, StopTimeUpdateStore};

/// A corrected snapshot and what happened to it.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub feed: FeedMessage,
    pub stats: ReconcileStats,
}

struct Matchers {
    trip_updates: TripUpdateMatcher,
    vehicle_positions: VehiclePositionMatcher,
    alerts: AlertMatcher,
}

type EntityOutcome = Option<(FeedEntity, EntityKind, MatchStatus)>;

impl Matchers {
    /// Dispatches to the matcher for the entity's payload. `None` for entities
    /// without one.
    async fn match_entity(&self, entity: &FeedEntity, now: i64) -> Result<EntityOutcome, MatchError> {
        let mut out = entity.clone();

        if let Some(tu) = &entity.trip_update {
            let corrected = self.trip_updates.match_trip_update(tu, now).await?;
            out.trip_update = Some(corrected.value);
            return Ok(Some((out, EntityKind::TripUpdate, corrected.status)));
        }
        if let Some(vp) = &entity.vehicle {
            let corrected = self.vehicle_positions.match_vehicle_position(vp).await?;
            out.vehicle = Some(corrected.value);
            return Ok(Some((out, EntityKind::VehiclePosition, corrected.status)));
        }
        if let Some(alert) = &entity.alert {
            let corrected = self.alerts.match_alert(alert).await?;
            out.alert = Some(corrected.value);
            return Ok(Some((out, EntityKind::Alert, corrected.status)));
        }
        Ok(None)
    }
}

pub struct Reconciler {
    matchers: Arc<Matchers>,
    history: Arc<StopTimeUpdateHistory>,
    replacement: TripReplacementEngine,
    metrics: Arc<dyn MetricsSink>,
    limiter: Arc<Semaphore>,
    digest_label: String,
}

impl Reconciler {
    pub fn new(
        config: &MatcherConfig,
        schedule: Arc<dyn ScheduleStore>,
        stop_time_updates: Arc<dyn StopTimeUpdateStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let digest_label = config.digest_label();
        let resolver = Arc::new(ScheduleResolver::new(
            schedule.clone(),
            metrics.clone(),
            digest_label.clone(),
            config.trip_id_suffix_separator.clone(),
            config.route_subdivisions.clone(),
        ));
        let matchers = Matchers {
            trip_updates: TripUpdateMatcher::new(resolver.clone()),
            vehicle_positions: VehiclePositionMatcher::new(resolver.clone()),
            alerts: AlertMatcher::new(resolver),
        };
        let history = StopTimeUpdateHistory::new(
            stop_time_updates,
            metrics.clone(),
            digest_label.clone(),
            config.stop_time_updates_max_age,
        );

        Self {
            matchers: Arc::new(matchers),
            history: Arc::new(history),
            replacement: TripReplacementEngine::new(schedule, metrics.clone(), digest_label.clone()),
            metrics,
            limiter: Arc::new(Semaphore::new(config.match_concurrency)),
            digest_label,
        }
    }

    /// The stop-time update history, for scheduling its retention sweep.
    pub fn history(&self) -> Arc<StopTimeUpdateHistory> {
        self.history.clone()
    }

    fn count_error(&self, stats: &mut ReconcileStats) {
        stats.errors += 1;
        self.metrics.inc_counter(
            FEED_ENTITY_ERRORS,
            &[("schedule_feed_digest", self.digest_label.as_str())],
        );
    }

    /// Reconciles one snapshot. `now` (unix seconds) picks the upcoming
    /// events used for trip-level delays.
    ///
    /// Never fails: an entity whose matching fails passes through unchanged,
    /// and failures of the history or replacement steps leave the snapshot
    /// as far as it got.
    #[tracing::instrument(
        skip_all,
        fields(
            schedule_digest = %self.digest_label,
            feed_timestamp = feed.header.timestamp.unwrap_or_default(),
            entities = feed.entity.len(),
        )
    )]
    pub async fn reconcile(&self, feed: FeedMessage, now: i64) -> Reconciled {
        let t0 = Instant::now();
        let mut stats = ReconcileStats::from_feed(&feed, &self.digest_label);
        let observations = collect_observations(&feed);

        let mut feed = feed;
        match self.history.restore(&mut feed).await {
            Ok(restored) => stats.restored = restored,
            Err(e) => {
                warn!(error = %e, "Failed to restore StopTimeUpdates");
                self.count_error(&mut stats);
            }
        }

        let FeedMessage { header, entity } = feed;
        let mut handles = Vec::with_capacity(entity.len());
        for e in &entity {
            let matchers = self.matchers.clone();
            let limiter = self.limiter.clone();
            let input = e.clone();
            let span = info_span!("match_entity", entity_id = %e.id);
            handles.push(tokio::spawn(
                async move {
                    let Ok(_permit) = limiter.acquire_owned().await else {
                        return Ok(None);
                    };
                    matchers.match_entity(&input, now).await
                }
                .instrument(span),
            ));
        }

        let mut corrected = Vec::with_capacity(entity.len());
        for (original, handle) in entity.into_iter().zip(handles) {
            match handle.await {
                Ok(Ok(Some((out, kind, status)))) => {
                    stats.record(kind, status);
                    corrected.push(out);
                }
                Ok(Ok(None)) => corrected.push(original),
                Ok(Err(e)) => {
                    warn!(entity_id = %original.id, error = %e, "Failed to match FeedEntity");
                    self.count_error(&mut stats);
                    corrected.push(original);
                }
                Err(e) => {
                    warn!(entity_id = %original.id, error = %e, "FeedEntity matching task failed");
                    self.count_error(&mut stats);
                    corrected.push(original);
                }
            }
        }
        let mut feed = FeedMessage {
            header,
            entity: corrected,
        };

        match self.history.store(&observations).await {
            Ok(stored) => stats.stored = stored,
            Err(e) => {
                warn!(error = %e, "Failed to store StopTimeUpdates");
                self.count_error(&mut stats);
            }
        }

        match self.replacement.apply(&mut feed).await {
            Ok(ReplacementOutcome::Applied(n)) => stats.canceled = n,
            Ok(ReplacementOutcome::OverLimit) => stats.replacement_skipped = true,
            Ok(ReplacementOutcome::Inactive) => {}
            Err(e) => {
                warn!(error = %e, "Failed to apply TripReplacementPeriods");
                self.count_error(&mut stats);
            }
        }

        let matching_time = elapsed_seconds(t0);
        self.metrics.observe_seconds(
            FEED_MATCHING_TIME,
            &[("schedule_feed_digest", self.digest_label.as_str())],
            matching_time,
        );
        stats.matching_time_ms = t0.elapsed().as_millis();
        info!(
            matching_time,
            matched_trip_updates = stats.matched_trip_updates,
            matched_vehicles = stats.matched_vehicles,
            canceled = stats.canceled,
            errors = stats.errors,
            "Reconciled FeedMessage"
        );

        Reconciled { feed, stats }
    }

    /// Reconciles snapshots from `rx` in order until the sender is dropped
    /// or the receiving side of `tx` goes away.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<FeedMessage>, tx: mpsc::Sender<Reconciled>) {
        while let Some(feed) = rx.recv().await {
            let reconciled = self.reconcile(feed, Utc::now().timestamp()).await;
            if tx.send(reconciled).await.is_err() {
                debug!("Output receiver dropped, stopping");
                return;
            }
        }
        debug!("Input sender dropped, stopping");
    }
}
