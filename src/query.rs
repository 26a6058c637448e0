use async_trait::async_trait;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, R2D2Connection};
use diesel::result::DatabaseErrorKind;
use diesel::sql_types;
use r2d2::{ManageConnection, PooledConnection};
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::completion::FaultReporter;
use crate::config::QueryConfig;
use crate::pool::ConnectionFault;

/// Latest observation per aircraft within the trailing window.
///
/// `DISTINCT ON (hex)` keeps the freshest row per ICAO address; the airline is
/// looked up by the three-letter operator prefix of the call sign.
const WINDOW_QUERY: &str = r#"
    SELECT latest.callsign, latest.airline, latest.country, latest.hex,
           latest.altitude_ft, latest.latitude, latest.longitude,
           latest.heading_deg, latest.speed_kt, latest.age_secs
    FROM (
        SELECT DISTINCT ON (p.hex)
               p.callsign,
               a.name AS airline,
               a.country,
               upper(p.hex) AS hex,
               p.altitude_ft,
               p.latitude,
               p.longitude,
               p.heading_deg,
               p.speed_kt,
               floor(extract(epoch FROM now() - p.observed_at))::bigint AS age_secs
        FROM aircraft_positions p
        LEFT JOIN airlines a ON a.icao = upper(left(p.callsign, 3))
        WHERE p.observed_at >= now() - make_interval(secs => $1::float8)
        ORDER BY p.hex, p.observed_at DESC
    ) latest
    ORDER BY latest.callsign, latest.hex
"#;

/// Transaction-local statement timeout, so Postgres abandons the query at the
/// same deadline the client gives up on it.
const STATEMENT_TIMEOUT: &str = "SELECT set_config('statement_timeout', $1, true)";

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Database(String),

    #[error("query exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("query task interrupted: {0}")]
    Interrupted(String),
}

/// One observed aircraft
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRow {
    pub callsign: String,
    pub airline: Option<String>,
    pub country: Option<String>,
    /// 24-bit ICAO address, six uppercase hex digits
    pub hex: String,
    pub altitude_ft: Option<i32>,
    pub latitude: f64,
    pub longitude: f64,
    pub heading_deg: Option<i32>,
    pub speed_kt: Option<i32>,
    /// Seconds since this aircraft was last observed
    pub age_secs: i64,
}

#[derive(QueryableByName, Debug)]
struct PositionRecord {
    #[diesel(sql_type = sql_types::Text)]
    callsign: String,
    #[diesel(sql_type = sql_types::Nullable<sql_types::Text>)]
    airline: Option<String>,
    #[diesel(sql_type = sql_types::Nullable<sql_types::Text>)]
    country: Option<String>,
    #[diesel(sql_type = sql_types::Text)]
    hex: String,
    #[diesel(sql_type = sql_types::Nullable<sql_types::Integer>)]
    altitude_ft: Option<i32>,
    #[diesel(sql_type = sql_types::Double)]
    latitude: f64,
    #[diesel(sql_type = sql_types::Double)]
    longitude: f64,
    #[diesel(sql_type = sql_types::Nullable<sql_types::Integer>)]
    heading_deg: Option<i32>,
    #[diesel(sql_type = sql_types::Nullable<sql_types::Integer>)]
    speed_kt: Option<i32>,
    #[diesel(sql_type = sql_types::BigInt)]
    age_secs: i64,
}

impl From<PositionRecord> for QueryRow {
    fn from(record: PositionRecord) -> Self {
        Self {
            callsign: record.callsign.trim().to_string(),
            airline: record.airline,
            country: record.country,
            hex: record.hex,
            altitude_ft: record.altitude_ft,
            latitude: record.latitude,
            longitude: record.longitude,
            heading_deg: record.heading_deg,
            speed_kt: record.speed_kt,
            // Clock skew between writer and database can make fresh rows look
            // slightly in the future
            age_secs: record.age_secs.max(0),
        }
    }
}

/// Bounds applied to every window query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySettings {
    pub period: Duration,
    pub deadline: Duration,
}

impl QuerySettings {
    pub fn period_secs(&self) -> i64 {
        i64::try_from(self.period.as_secs()).unwrap_or(i64::MAX)
    }
}

impl From<&QueryConfig> for QuerySettings {
    fn from(config: &QueryConfig) -> Self {
        Self {
            period: config.period(),
            deadline: config.deadline(),
        }
    }
}

/// Runs the window query on a leased connection.
#[async_trait]
pub trait QueryExecutor<M: ManageConnection>: Send + Sync + 'static {
    /// Run the query to completion. Transport-level failures should be
    /// reported through `faults` in addition to being returned.
    async fn run(
        &self,
        conn: PooledConnection<M>,
        faults: FaultReporter,
        settings: QuerySettings,
    ) -> Result<Vec<QueryRow>, QueryError>;

    /// Run the query, converting it into [`QueryError::DeadlineExceeded`] once
    /// `settings.deadline` elapses.
    async fn execute(
        &self,
        conn: PooledConnection<M>,
        faults: FaultReporter,
        settings: QuerySettings,
    ) -> Result<Vec<QueryRow>, QueryError> {
        match tokio::time::timeout(settings.deadline, self.run(conn, faults, settings)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::DeadlineExceeded(settings.deadline)),
        }
    }
}

/// Window query against PostgreSQL
#[derive(Debug, Clone, Copy, Default)]
pub struct PgFlightQuery;

#[async_trait]
impl QueryExecutor<ConnectionManager<PgConnection>> for PgFlightQuery {
    async fn run(
        &self,
        mut conn: PooledConnection<ConnectionManager<PgConnection>>,
        faults: FaultReporter,
        settings: QuerySettings,
    ) -> Result<Vec<QueryRow>, QueryError> {
        let period_secs = settings.period_secs();
        let statement_timeout = settings.deadline.as_millis().to_string();

        tokio::task::spawn_blocking(move || {
            let loaded = conn.transaction::<_, diesel::result::Error, _>(|tx| {
                diesel::sql_query(STATEMENT_TIMEOUT)
                    .bind::<sql_types::Text, _>(&statement_timeout)
                    .execute(tx)?;
                diesel::sql_query(WINDOW_QUERY)
                    .bind::<sql_types::BigInt, _>(period_secs)
                    .load::<PositionRecord>(tx)
            });

            match loaded {
                Ok(records) => {
                    debug!("Window query returned {} records", records.len());
                    let rows = records.into_iter().map(QueryRow::from).collect();
                    Ok(collapse(rows, period_secs))
                }
                Err(e) => {
                    if let Some(fault) = transport_fault(&e, conn.is_broken()) {
                        warn!("Connection fault during window query: {}", fault);
                        faults.report(fault);
                    }
                    Err(QueryError::Database(e.to_string()))
                }
            }
        })
        .await
        .map_err(|e| QueryError::Interrupted(e.to_string()))?
    }
}

fn transport_fault(error: &diesel::result::Error, broken: bool) -> Option<ConnectionFault> {
    match error {
        diesel::result::Error::DatabaseError(
            DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::UnableToSendCommand,
            info,
        ) => Some(ConnectionFault::Closed(info.message().to_string())),
        _ if broken => Some(ConnectionFault::Broken),
        _ => None,
    }
}

/// Keep rows no older than `period_secs`, one per ICAO address (the freshest),
/// ordered by call sign.
pub fn collapse(rows: Vec<QueryRow>, period_secs: i64) -> Vec<QueryRow> {
    let mut freshest: HashMap<String, QueryRow> = HashMap::new();

    for row in rows.into_iter().filter(|row| row.age_secs <= period_secs) {
        match freshest.entry(row.hex.to_ascii_uppercase()) {
            Entry::Occupied(mut entry) => {
                if row.age_secs < entry.get().age_secs {
                    entry.insert(row);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(row);
            }
        }
    }

    let mut rows: Vec<QueryRow> = freshest.into_values().collect();
    rows.sort_by(|a, b| a.callsign.cmp(&b.callsign).then_with(|| a.hex.cmp(&b.hex)));
    rows
}
