//! Resolution of a live trip reference to a scheduled trip instance.
//!
//! Live trip ids are usually a truncated form of the scheduled ones, e.g.
//! `072350_1..N03R` live vs `AFA23GEN-1092-Weekday-00_072350_1..N03R` in the
//! schedule. Strategies are tried in order until one yields an accepted result:
//! exact id, constructed id (allow-listed routes only), then suffix.

use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::RouteSubdivisions;
use crate::error::MatchError;
use crate::gtfs_rt::TripDescriptor;
use crate::metrics::{MetricsSink, elapsed_seconds};
use crate::store::{
    ScheduleStore, ScheduledStopTime, StopTimesQuery, TRIP_STOP_TIMES_LIMIT, TripIdFilter,
    format_gtfs_date, parse_gtfs_date,
};

/// Which kind of entity is being matched; selects the metric names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    TripUpdate,
    VehiclePosition,
    Alert,
}

impl MatchKind {
    pub fn metric_prefix(self) -> &'static str {
        match self {
            MatchKind::TripUpdate => "tripupdates",
            MatchKind::VehiclePosition => "vehiclepositions",
            MatchKind::Alert => "alerts",
        }
    }

    pub fn metric(self, suffix: &str) -> String {
        format!("{}_{}", self.metric_prefix(), suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    NonEmpty,
    ExactlyOne,
}

impl Acceptance {
    pub fn accepts(self, rows: &[ScheduledStopTime]) -> bool {
        match self {
            Acceptance::NonEmpty => !rows.is_empty(),
            Acceptance::ExactlyOne => rows.len() == 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Exact,
    Constructed,
    Suffix,
}

impl Strategy {
    pub fn label(self) -> &'static str {
        match self {
            Strategy::Exact => "exact",
            Strategy::Constructed => "exact_constructed",
            Strategy::Suffix => "by_suffix",
        }
    }
}

/// The `matching_method` metrics label, e.g. `trip_by_suffix_stop_id_stop_seq`.
pub fn matching_method(
    fetch_trip: bool,
    strategy: Strategy,
    with_stop_id: bool,
    with_stop_sequence: bool,
) -> String {
    let mut method = String::from(if fetch_trip { "trip_" } else { "stop_times_" });
    method.push_str(strategy.label());
    if with_stop_id {
        method.push_str("_stop_id");
    }
    if with_stop_sequence {
        method.push_str("_stop_seq");
    }
    method
}

/// Service code of a date as used in constructed trip ids.
pub fn day_type(date: NaiveDate) -> &'static str {
    match date.weekday() {
        Weekday::Sun => "SUN",
        Weekday::Sat => "SAT",
        _ => "WKD",
    }
}

/// `{subdivision}{YYYYMMDD}{SUN|WKD|SAT}{separator}{live trip id}`
pub fn constructed_trip_id(
    subdivision: &str,
    date: NaiveDate,
    separator: &str,
    live_trip_id: &str,
) -> String {
    format!(
        "{subdivision}{}{}{separator}{live_trip_id}",
        format_gtfs_date(date),
        day_type(date)
    )
}

/// A live trip reference with its required parts present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripRef {
    pub route_id: String,
    pub start_date: String,
    pub trip_id: String,
}

impl TripRef {
    pub fn from_descriptor(trip: &TripDescriptor) -> Result<Self, MatchError> {
        fn required(value: &Option<String>, field: &str) -> Result<String, MatchError> {
            match value.as_deref() {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(MatchError::malformed(format!("missing/empty {field}"))),
            }
        }
        Ok(Self {
            route_id: required(&trip.route_id, "route_id")?,
            start_date: required(&trip.start_date, "start_date")?,
            trip_id: required(&trip.trip_id, "trip_id")?,
        })
    }

    pub fn date(&self) -> Result<NaiveDate, MatchError> {
        parse_gtfs_date(&self.start_date).ok_or_else(|| {
            MatchError::malformed(format!("invalid start_date {:?}", self.start_date))
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    pub kind: MatchKind,
    pub trip: &'a TripRef,
    pub stop_id: Option<&'a str>,
    pub stop_sequence: Option<u32>,
    pub acceptance: Acceptance,
    pub match_limit: usize,
    /// Return the whole matched trip's stop-times instead of the stop-level rows.
    pub fetch_trip: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub stop_times: Vec<ScheduledStopTime>,
    pub strategy: Option<Strategy>,
    pub matching_method: Option<String>,
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        self.strategy.is_some()
    }

    /// Scheduled trip id of the match.
    pub fn trip_id(&self) -> Option<&str> {
        self.stop_times.first().map(|st| st.trip_id.as_str())
    }
}

pub struct ScheduleResolver {
    store: Arc<dyn ScheduleStore>,
    metrics: Arc<dyn MetricsSink>,
    digest_label: String,
    separator: String,
    subdivisions: RouteSubdivisions,
}

impl ScheduleResolver {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        metrics: Arc<dyn MetricsSink>,
        digest_label: String,
        separator: String,
        subdivisions: RouteSubdivisions,
    ) -> Self {
        Self {
            store,
            metrics,
            digest_label,
            separator,
            subdivisions,
        }
    }

    pub fn digest_label(&self) -> &str {
        &self.digest_label
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    fn strategies(&self, trip: &TripRef, date: NaiveDate) -> Vec<(Strategy, TripIdFilter)> {
        let mut out = vec![(Strategy::Exact, TripIdFilter::Exact(trip.trip_id.clone()))];
        if let Some(subdivision) = self.subdivisions.get(&trip.route_id) {
            out.push((
                Strategy::Constructed,
                TripIdFilter::Exact(constructed_trip_id(
                    subdivision,
                    date,
                    &self.separator,
                    &trip.trip_id,
                )),
            ));
        }
        out.push((
            Strategy::Suffix,
            TripIdFilter::Suffix(format!("{}{}", self.separator, trip.trip_id)),
        ));
        out
    }

    #[tracing::instrument(
        skip(self, req),
        fields(
            schedule_digest = %self.digest_label,
            route_id = %req.trip.route_id,
            start_date = %req.trip.start_date,
            trip_id = %req.trip.trip_id,
        )
    )]
    pub async fn resolve(&self, req: &ResolveRequest<'_>) -> Result<MatchOutcome, MatchError> {
        let trip = req.trip;
        let date = trip.date()?;

        if req.stop_id.is_none() {
            warn!(
                stop_sequence = ?req.stop_sequence,
                "Matching without stop_id, risking incorrectly matched trip"
            );
        } else if req.stop_sequence.is_none() {
            warn!(
                stop_id = ?req.stop_id,
                "Matching without stop_sequence, risking incorrectly matched stop_times row"
            );
        }

        for (strategy, filter) in self.strategies(trip, date) {
            let method = matching_method(
                req.fetch_trip,
                strategy,
                req.stop_id.is_some(),
                req.stop_sequence.is_some(),
            );
            let query = StopTimesQuery {
                route_id: trip.route_id.clone(),
                date,
                trip_id: filter,
                stop_id: req.stop_id.map(str::to_string),
                stop_sequence: req.stop_sequence,
                match_limit: req.match_limit,
                trip_stop_times_limit: req.fetch_trip.then_some(TRIP_STOP_TIMES_LIMIT),
            };

            let t0 = Instant::now();
            let rows = self.store.query_stop_times(&query).await?;
            let accepted = req.acceptance.accepts(&rows);

            self.metrics.observe_seconds(
                &req.kind.metric("matching_db_query_time_seconds"),
                &[
                    ("schedule_feed_digest", self.digest_label.as_str()),
                    ("route_id", trip.route_id.as_str()),
                    ("matching_method", method.as_str()),
                    ("success", if accepted { "true" } else { "false" }),
                ],
                elapsed_seconds(t0),
            );
            let labels = [
                ("schedule_feed_digest", self.digest_label.as_str()),
                ("route_id", trip.route_id.as_str()),
                ("matching_method", method.as_str()),
            ];

            if !req.fetch_trip {
                let distinct: HashSet<(&str, NaiveDate)> = rows
                    .iter()
                    .map(|st| (st.trip_id.as_str(), st.date))
                    .collect();
                if distinct.len() > 1 {
                    warn!(
                        matching_method = %method,
                        candidates = distinct.len(),
                        "Trip reference matches more than one scheduled trip"
                    );
                    self.metrics
                        .inc_counter(&req.kind.metric("ambiguous_matches_total"), &labels);
                }
            }

            if accepted {
                self.metrics
                    .inc_counter(&req.kind.metric("matching_successes_total"), &labels);
                debug!(
                    matching_method = %method,
                    scheduled_trip_id = rows.first().map(|st| st.trip_id.as_str()).unwrap_or_default(),
                    "Found matching scheduled trip"
                );
                return Ok(MatchOutcome {
                    stop_times: rows,
                    strategy: Some(strategy),
                    matching_method: Some(method),
                });
            }
            self.metrics
                .inc_counter(&req.kind.metric("matching_failures_total"), &labels);
            trace!(matching_method = %method, rows = rows.len(), "Strategy did not match");
        }

        Ok(MatchOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::store::MemoryScheduleStore;
    use chrono::{TimeZone, Utc};

    fn stop_time(trip_id: &str, stop_id: &str, seq: u32) -> ScheduledStopTime {
        ScheduledStopTime {
            route_id: "1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
            trip_id: trip_id.to_string(),
            stop_id: stop_id.to_string(),
            stop_sequence: seq,
            arrival: Utc.timestamp_opt(1710953640 + i64::from(seq) * 60, 0).single(),
            departure: Utc.timestamp_opt(1710953640 + i64::from(seq) * 60, 0).single(),
            trip_start_time: None,
        }
    }

    fn resolver(
        rows: Vec<ScheduledStopTime>,
        subdivisions: RouteSubdivisions,
    ) -> (ScheduleResolver, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let resolver = ScheduleResolver::new(
            Arc::new(MemoryScheduleStore::new(rows)),
            metrics.clone(),
            "abcdef01".to_string(),
            "_".to_string(),
            subdivisions,
        );
        (resolver, metrics)
    }

    fn trip_ref(trip_id: &str) -> TripRef {
        TripRef {
            route_id: "1".to_string(),
            start_date: "20240320".to_string(),
            trip_id: trip_id.to_string(),
        }
    }

    fn request<'a>(trip: &'a TripRef, stop_id: Option<&'a str>) -> ResolveRequest<'a> {
        ResolveRequest {
            kind: MatchKind::TripUpdate,
            trip,
            stop_id,
            stop_sequence: None,
            acceptance: Acceptance::NonEmpty,
            match_limit: 1,
            fetch_trip: true,
        }
    }

    #[test]
    fn test_day_type() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        assert_eq!(day_type(d(2024, 3, 17)), "SUN");
        assert_eq!(day_type(d(2024, 3, 18)), "WKD");
        assert_eq!(day_type(d(2024, 3, 22)), "WKD");
        assert_eq!(day_type(d(2024, 3, 23)), "SAT");
    }

    #[test]
    fn test_constructed_trip_id() {
        let date = NaiveDate::from_ymd_opt(2011, 12, 4).unwrap();
        assert_eq!(
            constructed_trip_id("A", date, "_", "021150_2..N08R"),
            "A20111204SUN_021150_2..N08R"
        );
    }

    #[test]
    fn test_matching_method_labels() {
        assert_eq!(matching_method(true, Strategy::Exact, false, false), "trip_exact");
        assert_eq!(
            matching_method(false, Strategy::Suffix, true, true),
            "stop_times_by_suffix_stop_id_stop_seq"
        );
        assert_eq!(
            matching_method(true, Strategy::Constructed, true, false),
            "trip_exact_constructed_stop_id"
        );
    }

    #[test]
    fn test_trip_ref_requires_fields() {
        let mut trip = TripDescriptor {
            trip_id: Some("t".to_string()),
            route_id: Some("1".to_string()),
            start_date: Some("20240320".to_string()),
            ..Default::default()
        };
        assert!(TripRef::from_descriptor(&trip).is_ok());

        trip.route_id = Some(String::new());
        assert!(matches!(
            TripRef::from_descriptor(&trip),
            Err(MatchError::Malformed(_))
        ));
        trip.route_id = None;
        assert!(TripRef::from_descriptor(&trip).is_err());
    }

    #[tokio::test]
    async fn test_resolve_by_suffix_after_exact_and_constructed_fail() {
        let scheduled = "AFA23GEN-1092-Weekday-00_072350_1..N03R";
        let (resolver, metrics) = resolver(
            vec![stop_time(scheduled, "104N", 1), stop_time(scheduled, "103N", 2)],
            RouteSubdivisions::default(),
        );
        let trip = trip_ref("072350_1..N03R");

        let outcome = resolver.resolve(&request(&trip, Some("104N"))).await.unwrap();
        assert!(outcome.is_match());
        assert_eq!(outcome.strategy, Some(Strategy::Suffix));
        assert_eq!(outcome.trip_id(), Some(scheduled));
        assert_eq!(outcome.stop_times.len(), 2);

        let labels = |method| {
            [
                ("schedule_feed_digest", "abcdef01"),
                ("route_id", "1"),
                ("matching_method", method),
            ]
        };
        assert_eq!(
            metrics.counter("tripupdates_matching_failures_total", &labels("trip_exact_stop_id")),
            1
        );
        assert_eq!(
            metrics.counter(
                "tripupdates_matching_failures_total",
                &labels("trip_exact_constructed_stop_id")
            ),
            1
        );
        assert_eq!(
            metrics.counter(
                "tripupdates_matching_successes_total",
                &labels("trip_by_suffix_stop_id")
            ),
            1
        );
        assert_eq!(
            metrics.summary_count_total("tripupdates_matching_db_query_time_seconds"),
            3
        );
    }

    #[tokio::test]
    async fn test_resolve_constructed_id() {
        let scheduled = "A20240320WKD_072350_1..N03R";
        let (resolver, _) = resolver(
            vec![stop_time(scheduled, "104N", 1)],
            RouteSubdivisions::default(),
        );
        let trip = trip_ref("072350_1..N03R");

        let outcome = resolver.resolve(&request(&trip, Some("104N"))).await.unwrap();
        assert_eq!(outcome.strategy, Some(Strategy::Constructed));
        assert_eq!(outcome.trip_id(), Some(scheduled));
    }

    #[tokio::test]
    async fn test_constructed_skipped_for_unlisted_route() {
        let (resolver, metrics) = resolver(vec![], RouteSubdivisions::from_entries([("7", "B")]));
        let trip = trip_ref("072350_1..N03R");

        let outcome = resolver.resolve(&request(&trip, Some("104N"))).await.unwrap();
        assert!(!outcome.is_match());
        assert!(outcome.stop_times.is_empty());
        assert_eq!(metrics.counter_total("tripupdates_matching_failures_total"), 2);
    }

    #[tokio::test]
    async fn test_exact_match_wins() {
        let scheduled = "AFA23GEN-1092-Weekday-00_072350_1..N03R";
        let (resolver, _) = resolver(
            vec![stop_time(scheduled, "104N", 1)],
            RouteSubdivisions::default(),
        );
        let trip = trip_ref(scheduled);

        let outcome = resolver.resolve(&request(&trip, Some("104N"))).await.unwrap();
        assert_eq!(outcome.strategy, Some(Strategy::Exact));
    }

    #[tokio::test]
    async fn test_exactly_one_rejects_ambiguous() {
        let (resolver, metrics) = resolver(
            vec![
                stop_time("X_loop", "airport", 1),
                stop_time("Y_loop", "airport", 1),
            ],
            RouteSubdivisions::from_entries(Vec::<(String, String)>::new()),
        );
        let trip = trip_ref("loop");
        let req = ResolveRequest {
            kind: MatchKind::VehiclePosition,
            trip: &trip,
            stop_id: Some("airport"),
            stop_sequence: Some(1),
            acceptance: Acceptance::ExactlyOne,
            match_limit: 2,
            fetch_trip: false,
        };

        let outcome = resolver.resolve(&req).await.unwrap();
        assert!(!outcome.is_match());
        assert_eq!(
            metrics.counter_total("vehiclepositions_ambiguous_matches_total"),
            1
        );
        assert_eq!(
            metrics.counter_total("vehiclepositions_matching_failures_total"),
            2
        );
    }

    #[tokio::test]
    async fn test_invalid_date_is_malformed() {
        let (resolver, _) = resolver(vec![], RouteSubdivisions::default());
        let mut trip = trip_ref("t");
        trip.start_date = "2024-03-20".to_string();

        let result = resolver.resolve(&request(&trip, None)).await;
        assert!(matches!(result, Err(MatchError::Malformed(_))));
    }
}
