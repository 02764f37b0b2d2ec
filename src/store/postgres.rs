//! PostgreSQL datastores.
//!
//! The schedule side reads the `arrivals_departures` and `stop_times` tables
//! of one schedule version; the history side owns `previous_stoptimeupdates`.
//! Every table lives in a configured schema.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use super::{
    CanceledTrip, PreviousStopTimeUpdate, ReplacementWindow, ScheduleStore, ScheduledStopTime,
    StopTimeUpdateStore, StopTimesQuery, TripIdFilter,
};
use crate::error::StoreError;

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

fn validate_schema(schema: &str) -> Result<String, StoreError> {
    let mut chars = schema.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && schema.len() <= 63 {
        Ok(schema.to_string())
    } else {
        Err(StoreError::InvalidSchema(schema.to_string()))
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn stop_sequence_from_row(row: &PgRow) -> Result<u32, StoreError> {
    let seq: i32 = row.try_get("stop_sequence")?;
    u32::try_from(seq).map_err(|_| StoreError::InvalidRow(format!("negative stop_sequence {seq}")))
}

fn stop_time_from_row(row: &PgRow) -> Result<ScheduledStopTime, StoreError> {
    Ok(ScheduledStopTime {
        route_id: row.try_get("route_id")?,
        date: row.try_get("date")?,
        trip_id: row.try_get("trip_id")?,
        stop_id: row.try_get("stop_id")?,
        stop_sequence: stop_sequence_from_row(row)?,
        arrival: row.try_get::<Option<DateTime<Utc>>, _>("t_arrival")?,
        departure: row.try_get::<Option<DateTime<Utc>>, _>("t_departure")?,
        trip_start_time: None,
    })
}

pub struct PgScheduleStore {
    pool: PgPool,
    schema: String,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool, schema: &str) -> Result<Self, StoreError> {
        Ok(Self {
            pool,
            schema: validate_schema(schema)?,
        })
    }

    fn stop_level_sql(&self, trip_id: &TripIdFilter) -> String {
        let trip_clause = match trip_id {
            TripIdFilter::Exact(_) => "trip_id = $5::text",
            TripIdFilter::Suffix(_) => "right(trip_id, char_length($5::text)) = $5::text",
        };
        format!(
            r#"SELECT route_id, "date"::date AS "date", trip_id, stop_id, stop_sequence, t_arrival, t_departure
FROM {schema}.arrivals_departures
WHERE route_id = $1
AND "date"::date = $2
AND ($3::text IS NULL OR stop_id = $3::text)
AND ($4::integer IS NULL OR stop_sequence = $4::integer)
AND {trip_clause}
AND frequencies_it = -1
ORDER BY stop_sequence_consec ASC
LIMIT $6"#,
            schema = self.schema,
        )
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn query_stop_times(
        &self,
        query: &StopTimesQuery,
    ) -> Result<Vec<ScheduledStopTime>, StoreError> {
        let stop_level = self.stop_level_sql(&query.trip_id);
        let sql = match query.trip_stop_times_limit {
            None => stop_level,
            Some(_) => format!(
                r#"WITH st AS (
{stop_level}
)
SELECT ad.route_id, ad."date"::date AS "date", ad.trip_id, ad.stop_id, ad.stop_sequence, ad.t_arrival, ad.t_departure
FROM {schema}.arrivals_departures ad
WHERE ad."date"::date = (SELECT "date" FROM st LIMIT 1)
AND ad.trip_id = (SELECT trip_id FROM st LIMIT 1)
ORDER BY ad.stop_sequence_consec ASC
LIMIT $7"#,
                schema = self.schema,
            ),
        };

        let stop_sequence = query.stop_sequence.and_then(|s| i32::try_from(s).ok());
        let mut q = sqlx::query(&sql)
            .bind(&query.route_id)
            .bind(query.date)
            .bind(query.stop_id.as_deref())
            .bind(stop_sequence)
            .bind(query.trip_id.value())
            .bind(to_i64(query.match_limit));
        if let Some(limit) = query.trip_stop_times_limit {
            q = q.bind(to_i64(limit));
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(stop_time_from_row).collect()
    }

    async fn trips_within_windows(
        &self,
        windows: &[ReplacementWindow],
        exclude_trip_ids: &[String],
        limit: usize,
    ) -> Result<Vec<CanceledTrip>, StoreError> {
        if windows.is_empty() {
            return Ok(Vec::new());
        }

        let route_ids: Vec<String> = windows.iter().map(|w| w.route_id.clone()).collect();
        let starts: Vec<DateTime<Utc>> = windows.iter().map(|w| w.start).collect();
        let ends: Vec<DateTime<Utc>> = windows.iter().map(|w| w.end).collect();

        let sql = format!(
            r#"SELECT DISTINCT ON (ad.trip_id, ad."date")
    ad.trip_id,
    ad.route_id,
    ad."date"::date AS "date",
    st0.departure_time::text AS start_time
FROM {schema}.arrivals_departures ad
JOIN UNNEST($2::text[], $3::timestamptz[], $4::timestamptz[]) AS w(route_id, start_t, end_t)
    ON ad.route_id = w.route_id
    AND coalesce(ad.t_arrival, ad.t_departure) >= w.start_t
    AND coalesce(ad.t_departure, ad.t_arrival) < w.end_t
LEFT JOIN {schema}.stop_times st0 ON ad.trip_id = st0.trip_id AND st0.stop_sequence_consec = 0
WHERE ad.frequencies_it = -1
AND NOT (ad.trip_id = ANY($1::text[]))
ORDER BY ad.trip_id, ad."date"
LIMIT $5"#,
            schema = self.schema,
        );

        let rows = sqlx::query(&sql)
            .bind(exclude_trip_ids)
            .bind(&route_ids)
            .bind(&starts)
            .bind(&ends)
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(CanceledTrip {
                    route_id: row.try_get("route_id")?,
                    trip_id: row.try_get("trip_id")?,
                    date: row.try_get::<NaiveDate, _>("date")?,
                    start_time: row.try_get::<Option<String>, _>("start_time")?,
                })
            })
            .collect()
    }
}

pub struct PgStopTimeUpdateStore {
    pool: PgPool,
    schema: String,
}

impl PgStopTimeUpdateStore {
    pub fn new(pool: PgPool, schema: &str) -> Result<Self, StoreError> {
        Ok(Self {
            pool,
            schema: validate_schema(schema)?,
        })
    }

    /// Creates `previous_stoptimeupdates` if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        let sql = format!(
            r#"CREATE TABLE IF NOT EXISTS {schema}.previous_stoptimeupdates (
    trip_id TEXT NOT NULL,
    start_date DATE NOT NULL,
    stop_id TEXT NOT NULL,
    "timestamp" BIGINT NOT NULL,
    arrival_time BIGINT,
    arrival_delay INTEGER,
    departure_time BIGINT,
    departure_delay INTEGER,
    CONSTRAINT previous_stoptimeupdates_unique UNIQUE (trip_id, start_date, stop_id)
)"#,
            schema = self.schema,
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        debug!(schema = %self.schema, "Ensured previous_stoptimeupdates table");
        Ok(())
    }
}

#[async_trait]
impl StopTimeUpdateStore for PgStopTimeUpdateStore {
    async fn upsert(&self, rows: &[PreviousStopTimeUpdate]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            r#"INSERT INTO {schema}.previous_stoptimeupdates (
    trip_id, start_date, stop_id,
    "timestamp",
    arrival_time, arrival_delay,
    departure_time, departure_delay
)
SELECT * FROM UNNEST(
    $1::text[], $2::date[], $3::text[],
    $4::bigint[],
    $5::bigint[], $6::integer[],
    $7::bigint[], $8::integer[]
)
ON CONFLICT ON CONSTRAINT previous_stoptimeupdates_unique DO UPDATE
    SET
        "timestamp" = excluded."timestamp",
        arrival_time = excluded.arrival_time,
        arrival_delay = excluded.arrival_delay,
        departure_time = excluded.departure_time,
        departure_delay = excluded.departure_delay
    WHERE excluded."timestamp" >= previous_stoptimeupdates."timestamp""#,
            schema = self.schema,
        );

        let result = sqlx::query(&sql)
            .bind(rows.iter().map(|r| r.trip_id.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.start_date).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.stop_id.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.timestamp).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.arrival_time).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.arrival_delay).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.departure_time).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.departure_delay).collect::<Vec<_>>())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_for_trips(
        &self,
        trips: &[(String, NaiveDate)],
    ) -> Result<Vec<PreviousStopTimeUpdate>, StoreError> {
        if trips.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"SELECT
    p.trip_id, p.start_date, p.stop_id,
    p."timestamp",
    p.arrival_time, p.arrival_delay,
    p.departure_time, p.departure_delay
FROM {schema}.previous_stoptimeupdates p
JOIN UNNEST($1::text[], $2::date[]) AS wanted(trip_id, start_date)
    ON p.trip_id = wanted.trip_id AND p.start_date = wanted.start_date
ORDER BY p.trip_id ASC, p.start_date ASC, p.stop_id ASC"#,
            schema = self.schema,
        );

        let rows = sqlx::query(&sql)
            .bind(trips.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>())
            .bind(trips.iter().map(|(_, date)| *date).collect::<Vec<_>>())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(PreviousStopTimeUpdate {
                    trip_id: row.try_get("trip_id")?,
                    start_date: row.try_get("start_date")?,
                    stop_id: row.try_get("stop_id")?,
                    timestamp: row.try_get("timestamp")?,
                    arrival_time: row.try_get("arrival_time")?,
                    arrival_delay: row.try_get("arrival_delay")?,
                    departure_time: row.try_get("departure_time")?,
                    departure_delay: row.try_get("departure_delay")?,
                })
            })
            .collect()
    }

    async fn delete_older_than(&self, timestamp: i64) -> Result<u64, StoreError> {
        let sql = format!(
            r#"DELETE FROM {schema}.previous_stoptimeupdates
WHERE "timestamp" < $1"#,
            schema = self.schema,
        );
        let result = sqlx::query(&sql)
            .bind(timestamp)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_schema() {
        assert_eq!(validate_schema("public").unwrap(), "public");
        assert_eq!(validate_schema("gtfs_3f2a").unwrap(), "gtfs_3f2a");
        assert!(validate_schema("").is_err());
        assert!(validate_schema("1abc").is_err());
        assert!(validate_schema("a; DROP TABLE x").is_err());
        assert!(validate_schema("a.b").is_err());
    }

    #[test]
    fn test_to_i64_saturates() {
        assert_eq!(to_i64(5), 5);
        assert_eq!(to_i64(usize::MAX), i64::MAX);
    }
}
