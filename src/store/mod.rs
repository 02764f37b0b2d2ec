//! Datastore seams.
//!
//! [`ScheduleStore`] is the read side over one schedule version's stop-times;
//! [`StopTimeUpdateStore`] persists the most recently observed stop-time
//! updates so later snapshots can be backfilled. Both have a PostgreSQL and an
//! in-memory implementation.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryScheduleStore, MemoryStopTimeUpdateStore};
pub use postgres::{PgScheduleStore, PgStopTimeUpdateStore, connect_pool};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StoreError;

/// Maximum number of stop-times fetched for one matched trip.
pub const TRIP_STOP_TIMES_LIMIT: usize = 1000;

/// One scheduled arrival/departure of one trip instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledStopTime {
    pub route_id: String,
    pub date: NaiveDate,
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival: Option<DateTime<Utc>>,
    pub departure: Option<DateTime<Utc>>,
    /// `HH:MM:SS` of the trip's first departure, may exceed 24h.
    pub trip_start_time: Option<String>,
}

impl ScheduledStopTime {
    /// Arrival if present, otherwise departure.
    pub fn first_instant(&self) -> Option<DateTime<Utc>> {
        self.arrival.or(self.departure)
    }

    /// Departure if present, otherwise arrival.
    pub fn last_instant(&self) -> Option<DateTime<Utc>> {
        self.departure.or(self.arrival)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripIdFilter {
    /// Scheduled trip id equals the value.
    Exact(String),
    /// Scheduled trip id ends with the value (separator included).
    Suffix(String),
}

impl TripIdFilter {
    pub fn matches(&self, trip_id: &str) -> bool {
        match self {
            TripIdFilter::Exact(id) => trip_id == id,
            TripIdFilter::Suffix(suffix) => trip_id.ends_with(suffix.as_str()),
        }
    }

    pub fn value(&self) -> &str {
        match self {
            TripIdFilter::Exact(v) | TripIdFilter::Suffix(v) => v,
        }
    }
}

/// Stop-times lookup for one (route, date) and trip id filter.
///
/// Rows matching the stop filters are ordered by in-trip order and capped at
/// `match_limit`. With `trip_stop_times_limit` set, the first matching row's
/// whole trip is returned instead, capped at that limit.
#[derive(Debug, Clone, PartialEq)]
pub struct StopTimesQuery {
    pub route_id: String,
    pub date: NaiveDate,
    pub trip_id: TripIdFilter,
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub match_limit: usize,
    pub trip_stop_times_limit: Option<usize>,
}

/// Half-open `[start, end)` window during which the live feed is
/// authoritative for a route.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplacementWindow {
    pub route_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReplacementWindow {
    /// Whether a stop-time falls inside the window.
    pub fn covers(&self, st: &ScheduledStopTime) -> bool {
        match (st.first_instant(), st.last_instant()) {
            (Some(first), Some(last)) => first >= self.start && last < self.end,
            _ => false,
        }
    }
}

/// A scheduled trip instance with no live counterpart inside a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanceledTrip {
    pub route_id: String,
    pub trip_id: String,
    pub date: NaiveDate,
    pub start_time: Option<String>,
}

/// Last observed arrival/departure of one (trip, start date, stop).
///
/// Each event keeps either an absolute time or a delay, time preferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousStopTimeUpdate {
    pub trip_id: String,
    pub start_date: NaiveDate,
    pub stop_id: String,
    pub timestamp: i64,
    pub arrival_time: Option<i64>,
    pub arrival_delay: Option<i32>,
    pub departure_time: Option<i64>,
    pub departure_delay: Option<i32>,
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn query_stop_times(
        &self,
        query: &StopTimesQuery,
    ) -> Result<Vec<ScheduledStopTime>, StoreError>;

    /// Trip instances with a stop-time inside any of `windows` whose trip id
    /// is not in `exclude_trip_ids`, at most `limit` rows.
    async fn trips_within_windows(
        &self,
        windows: &[ReplacementWindow],
        exclude_trip_ids: &[String],
        limit: usize,
    ) -> Result<Vec<CanceledTrip>, StoreError>;
}

#[async_trait]
pub trait StopTimeUpdateStore: Send + Sync {
    /// Inserts or replaces rows, never overwriting a row with an older
    /// timestamp. Returns the number of rows written.
    async fn upsert(&self, rows: &[PreviousStopTimeUpdate]) -> Result<u64, StoreError>;

    async fn fetch_for_trips(
        &self,
        trips: &[(String, NaiveDate)],
    ) -> Result<Vec<PreviousStopTimeUpdate>, StoreError>;

    /// Deletes rows whose timestamp is before `timestamp`.
    async fn delete_older_than(&self, timestamp: i64) -> Result<u64, StoreError>;
}

/// Parses a GTFS `YYYYMMDD` service date.
pub fn parse_gtfs_date(raw: &str) -> Option<NaiveDate> {
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

pub fn format_gtfs_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_gtfs_date() {
        assert_eq!(
            parse_gtfs_date("20240320"),
            NaiveDate::from_ymd_opt(2024, 3, 20)
        );
        assert_eq!(parse_gtfs_date("2024-03-20"), None);
        assert_eq!(parse_gtfs_date("2024032"), None);
        assert_eq!(parse_gtfs_date("20241340"), None);
        assert_eq!(parse_gtfs_date(""), None);
    }

    #[test]
    fn test_format_gtfs_date_pads_month() {
        let date = NaiveDate::from_ymd_opt(2019, 5, 4).unwrap();
        assert_eq!(format_gtfs_date(date), "20190504");
    }

    #[test]
    fn test_trip_id_filter() {
        let exact = TripIdFilter::Exact("a_b".to_string());
        assert!(exact.matches("a_b"));
        assert!(!exact.matches("x_a_b"));

        let suffix = TripIdFilter::Suffix("_072350_1..N03R".to_string());
        assert!(suffix.matches("AFA23GEN-1092-Weekday-00_072350_1..N03R"));
        assert!(!suffix.matches("072350_1..N03R"));
    }

    #[test]
    fn test_window_covers_is_half_open() {
        let at = |s| Utc.timestamp_opt(s, 0).single();
        let window = ReplacementWindow {
            route_id: "1".to_string(),
            start: Utc.timestamp_opt(100, 0).unwrap(),
            end: Utc.timestamp_opt(200, 0).unwrap(),
        };
        let mut st = ScheduledStopTime {
            route_id: "1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
            trip_id: "t".to_string(),
            stop_id: "s".to_string(),
            stop_sequence: 1,
            arrival: at(100),
            departure: None,
            trip_start_time: None,
        };
        assert!(window.covers(&st));

        st.arrival = None;
        st.departure = at(200);
        assert!(!window.covers(&st));

        st.arrival = at(150);
        st.departure = at(199);
        assert!(window.covers(&st));

        st.arrival = None;
        st.departure = None;
        assert!(!window.covers(&st));
    }
}
