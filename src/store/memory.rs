//! In-memory datastores, used in tests and for CSV-backed runs.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    CanceledTrip, PreviousStopTimeUpdate, ReplacementWindow, ScheduleStore, ScheduledStopTime,
    StopTimeUpdateStore, StopTimesQuery,
};
use crate::error::StoreError;

/// One row of a scheduled stop-times CSV export.
///
/// `arrival`/`departure` are RFC 3339 instants and may be empty.
#[derive(Debug, Deserialize)]
struct ScheduleCsvRecord {
    route_id: String,
    date: NaiveDate,
    trip_id: String,
    stop_id: String,
    stop_sequence: u32,
    arrival: Option<DateTime<FixedOffset>>,
    departure: Option<DateTime<FixedOffset>>,
    start_time: Option<String>,
}

impl From<ScheduleCsvRecord> for ScheduledStopTime {
    fn from(r: ScheduleCsvRecord) -> Self {
        ScheduledStopTime {
            route_id: r.route_id,
            date: r.date,
            trip_id: r.trip_id,
            stop_id: r.stop_id,
            stop_sequence: r.stop_sequence,
            arrival: r.arrival.map(|t| t.with_timezone(&Utc)),
            departure: r.departure.map(|t| t.with_timezone(&Utc)),
            trip_start_time: r.start_time.filter(|s| !s.is_empty()),
        }
    }
}

/// Schedule stop-times held in memory, ordered by (date, trip, stop sequence).
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    rows: Vec<ScheduledStopTime>,
}

impl MemoryScheduleStore {
    pub fn new(mut rows: Vec<ScheduledStopTime>) -> Self {
        rows.sort_by(|a, b| {
            (a.date, &a.trip_id, a.stop_sequence).cmp(&(b.date, &b.trip_id, b.stop_sequence))
        });
        Self { rows }
    }

    /// Loads stop-times from a CSV file with the columns
    /// `route_id,date,trip_id,stop_id,stop_sequence,arrival,departure,start_time`.
    pub fn from_csv(path: &str) -> Result<Self, StoreError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, StoreError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut rows = Vec::new();
        for record in rdr.deserialize::<ScheduleCsvRecord>() {
            rows.push(record?.into());
        }
        debug!(rows = rows.len(), "Loaded schedule stop-times");
        Ok(Self::new(rows))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn trip_stop_times(&self, date: NaiveDate, trip_id: &str) -> impl Iterator<Item = &ScheduledStopTime> {
        self.rows
            .iter()
            .filter(move |st| st.date == date && st.trip_id == trip_id)
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn query_stop_times(
        &self,
        query: &StopTimesQuery,
    ) -> Result<Vec<ScheduledStopTime>, StoreError> {
        let mut matching: Vec<&ScheduledStopTime> = self
            .rows
            .iter()
            .filter(|st| {
                st.route_id == query.route_id
                    && st.date == query.date
                    && query.trip_id.matches(&st.trip_id)
                    && query.stop_id.as_deref().is_none_or(|id| st.stop_id == id)
                    && query.stop_sequence.is_none_or(|seq| st.stop_sequence == seq)
            })
            .collect();
        matching.sort_by(|a, b| (a.stop_sequence, &a.trip_id).cmp(&(b.stop_sequence, &b.trip_id)));
        matching.truncate(query.match_limit);

        let Some(limit) = query.trip_stop_times_limit else {
            return Ok(matching.into_iter().cloned().collect());
        };
        let Some(first) = matching.first() else {
            return Ok(Vec::new());
        };
        Ok(self
            .trip_stop_times(first.date, &first.trip_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn trips_within_windows(
        &self,
        windows: &[ReplacementWindow],
        exclude_trip_ids: &[String],
        limit: usize,
    ) -> Result<Vec<CanceledTrip>, StoreError> {
        let excluded: HashSet<&str> = exclude_trip_ids.iter().map(String::as_str).collect();

        // (trip_id, date) -> canceled trip
        let mut found: BTreeMap<(String, NaiveDate), CanceledTrip> = BTreeMap::new();
        for st in &self.rows {
            if excluded.contains(st.trip_id.as_str()) {
                continue;
            }
            let in_window = windows
                .iter()
                .any(|w| w.route_id == st.route_id && w.covers(st));
            if !in_window {
                continue;
            }
            found
                .entry((st.trip_id.clone(), st.date))
                .or_insert_with(|| CanceledTrip {
                    route_id: st.route_id.clone(),
                    trip_id: st.trip_id.clone(),
                    date: st.date,
                    start_time: st.trip_start_time.clone(),
                });
        }

        Ok(found.into_values().take(limit).collect())
    }
}

type HistoryKey = (String, NaiveDate, String);

#[derive(Debug, Default)]
pub struct MemoryStopTimeUpdateStore {
    rows: RwLock<HashMap<HistoryKey, PreviousStopTimeUpdate>>,
}

impl MemoryStopTimeUpdateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn get(
        &self,
        trip_id: &str,
        start_date: NaiveDate,
        stop_id: &str,
    ) -> Option<PreviousStopTimeUpdate> {
        self.rows
            .read()
            .await
            .get(&(trip_id.to_string(), start_date, stop_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl StopTimeUpdateStore for MemoryStopTimeUpdateStore {
    async fn upsert(&self, rows: &[PreviousStopTimeUpdate]) -> Result<u64, StoreError> {
        let mut stored = self.rows.write().await;
        let mut written = 0;
        for row in rows {
            let key = (row.trip_id.clone(), row.start_date, row.stop_id.clone());
            let newer = stored
                .get(&key)
                .is_none_or(|prev| row.timestamp >= prev.timestamp);
            if newer {
                stored.insert(key, row.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn fetch_for_trips(
        &self,
        trips: &[(String, NaiveDate)],
    ) -> Result<Vec<PreviousStopTimeUpdate>, StoreError> {
        let wanted: HashSet<(&str, NaiveDate)> =
            trips.iter().map(|(id, date)| (id.as_str(), *date)).collect();
        let stored = self.rows.read().await;
        let mut rows: Vec<PreviousStopTimeUpdate> = stored
            .values()
            .filter(|r| wanted.contains(&(r.trip_id.as_str(), r.start_date)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (&a.trip_id, a.start_date, &a.stop_id).cmp(&(&b.trip_id, b.start_date, &b.stop_id))
        });
        Ok(rows)
    }

    async fn delete_older_than(&self, timestamp: i64) -> Result<u64, StoreError> {
        let mut stored = self.rows.write().await;
        let before = stored.len();
        stored.retain(|_, r| r.timestamp >= timestamp);
        Ok((before - stored.len()) as u64)
    }
}
