//! Flight - live board of recently observed aircraft.
//!
//! Each request leases a pooled PostgreSQL connection, runs one time-windowed
//! query under a deadline and renders the result (or a short status when
//! anything goes wrong) as an HTML table.

pub mod completion;
pub mod config;
pub mod handler;
pub mod log_format;
pub mod metrics;
pub mod pool;
pub mod query;
pub mod render;
pub mod view;
pub mod web;

pub use config::{Config, ConfigError};
pub use handler::{Dashboard, HandledRequest, HandlerState};
pub use pool::{AcquireError, ConnectionFault, ConnectionPool, Lease, PgPool};
pub use query::{PgFlightQuery, QueryError, QueryExecutor, QueryRow, QuerySettings};
pub use render::{Render, RenderError, TeraRenderer};
pub use view::{COLUMNS, Column, ViewModel};
pub use web::InitError;
