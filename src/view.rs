//! Render-ready view of the flight board.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::query::QueryRow;

pub const NO_CONNECTION_STATUS: &str = "Cannot establish database connection";

/// Table column: display name plus an optional physical unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: &'static str,
    pub unit: Option<&'static str>,
}

impl Column {
    const fn new(name: &'static str, unit: Option<&'static str>) -> Self {
        Self { name, unit }
    }
}

/// Columns of the board, in display order. Matches the field order of [`QueryRow`].
pub const COLUMNS: &[Column] = &[
    Column::new("Call sign", None),
    Column::new("Airline", None),
    Column::new("Country", None),
    Column::new("Hex", None),
    Column::new("Altitude", Some("ft")),
    Column::new("Latitude", Some("°")),
    Column::new("Longitude", Some("°")),
    Column::new("Heading", Some("°")),
    Column::new("Speed", Some("kt")),
    Column::new("Last seen", Some("s")),
];

/// Why a request could not show live data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedReason {
    NoConnection,
    QueryFailed,
    QueryTimedOut,
    ConnectionLost,
}

impl DegradedReason {
    /// Fixed, user-facing status text
    pub fn status(self) -> &'static str {
        match self {
            DegradedReason::NoConnection => NO_CONNECTION_STATUS,
            DegradedReason::QueryFailed => "Cannot retrieve flight data",
            DegradedReason::QueryTimedOut => "Flight data request timed out",
            DegradedReason::ConnectionLost => "Database connection lost",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewModel {
    pub rows: Vec<QueryRow>,
    pub columns: Vec<Column>,
    pub status: String,
}

impl ViewModel {
    pub fn build(rows: Vec<QueryRow>, columns: &[Column], refreshed_at: DateTime<Utc>) -> Self {
        Self {
            rows,
            columns: columns.to_vec(),
            status: format!("Refreshed at {}", refreshed_at.format("%Y-%m-%d %H:%M:%S UTC")),
        }
    }

    pub fn degraded(columns: &[Column], reason: DegradedReason) -> Self {
        Self {
            rows: Vec::new(),
            columns: columns.to_vec(),
            status: reason.status().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(callsign: &str) -> QueryRow {
        QueryRow {
            callsign: callsign.to_string(),
            airline: Some("Lufthansa".to_string()),
            country: Some("Germany".to_string()),
            hex: "3C6589".to_string(),
            altitude_ft: Some(36000),
            latitude: 50.03,
            longitude: 8.57,
            heading_deg: Some(90),
            speed_kt: Some(470),
            age_secs: 4,
        }
    }

    #[test]
    fn test_build_formats_refresh_status() {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 9, 3, 7).unwrap();
        let view = ViewModel::build(vec![row("DLH400"), row("DLH401")], COLUMNS, at);

        assert_eq!(view.rows.len(), 2);
        assert_eq!(view.columns.len(), COLUMNS.len());
        assert_eq!(view.status, "Refreshed at 2024-05-17 09:03:07 UTC");
    }

    #[test]
    fn test_degraded_has_no_rows() {
        let view = ViewModel::degraded(COLUMNS, DegradedReason::NoConnection);
        assert!(view.rows.is_empty());
        assert_eq!(view.status, "Cannot establish database connection");
        assert_eq!(view.columns, COLUMNS.to_vec());
    }

    #[test]
    fn test_units() {
        let units: Vec<_> = COLUMNS.iter().filter_map(|c| c.unit).collect();
        assert_eq!(units, vec!["ft", "°", "°", "°", "kt", "s"]);
    }
}
