//! Shared fakes for request pipeline tests.
//!
//! `FakeManager` is an in-process `r2d2::ManageConnection`, so the real
//! `ConnectionPool` (limits, timeouts, health checks) runs without a database.
//! `ScriptedExecutor` plays back one query outcome per run and
//! `RecordingRenderer` keeps every view it was asked to render.

#![allow(dead_code)]

use async_trait::async_trait;
use flight::completion::FaultReporter;
use flight::handler::Dashboard;
use flight::pool::{ConnectionFault, ConnectionPool};
use flight::query::{QueryError, QueryExecutor, QueryRow, QuerySettings};
use flight::render::{Render, RenderError};
use flight::view::ViewModel;
use r2d2::{ManageConnection, PooledConnection};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PERIOD: Duration = Duration::from_secs(60);
pub const DEADLINE: Duration = Duration::from_millis(200);

#[derive(Default)]
pub struct FakeDatabase {
    pub refuse_connections: AtomicBool,
    pub reject_validation: AtomicBool,
    pub opened: AtomicUsize,
    pub validations: AtomicUsize,
}

pub struct FakeConnection {
    pub id: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FakeError(String);

pub struct FakeManager(pub Arc<FakeDatabase>);

impl ManageConnection for FakeManager {
    type Connection = FakeConnection;
    type Error = FakeError;

    fn connect(&self) -> Result<FakeConnection, FakeError> {
        if self.0.refuse_connections.load(Ordering::SeqCst) {
            return Err(FakeError("connection refused".to_string()));
        }
        let id = self.0.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeConnection { id })
    }

    fn is_valid(&self, _conn: &mut FakeConnection) -> Result<(), FakeError> {
        self.0.validations.fetch_add(1, Ordering::SeqCst);
        if self.0.reject_validation.swap(false, Ordering::SeqCst) {
            return Err(FakeError("server closed the connection".to_string()));
        }
        Ok(())
    }

    fn has_broken(&self, _conn: &mut FakeConnection) -> bool {
        false
    }
}

pub fn fake_pool(limit: u32, acquire_timeout: Duration) -> (ConnectionPool<FakeManager>, Arc<FakeDatabase>) {
    let database = Arc::new(FakeDatabase::default());
    let pool = ConnectionPool::build(FakeManager(Arc::clone(&database)), limit, acquire_timeout);
    (pool, database)
}

#[derive(Clone)]
pub enum Script {
    Rows(Vec<QueryRow>),
    Fail,
    Hang,
    Slow(Duration, Vec<QueryRow>),
    /// Report a transport fault, then return rows anyway
    FaultThenRows(Vec<QueryRow>),
    /// Return rows, then report a fault shortly afterwards
    RowsThenFault(Vec<QueryRow>),
    /// Panic inside the query task
    Panic,
}

#[derive(Default)]
pub struct ExecutorStats {
    pub runs: AtomicUsize,
    pub active: AtomicUsize,
    pub peak_active: AtomicUsize,
    /// Whether a fault reported after the query finished settled the request
    pub late_fault_settled: Mutex<Option<bool>>,
}

pub struct ScriptedExecutor {
    script: Script,
    stats: Arc<ExecutorStats>,
}

impl ScriptedExecutor {
    pub fn new(script: Script) -> (Self, Arc<ExecutorStats>) {
        let stats = Arc::new(ExecutorStats::default());
        (
            Self {
                script,
                stats: Arc::clone(&stats),
            },
            stats,
        )
    }
}

#[async_trait]
impl QueryExecutor<FakeManager> for ScriptedExecutor {
    async fn run(
        &self,
        conn: PooledConnection<FakeManager>,
        faults: FaultReporter,
        _settings: QuerySettings,
    ) -> Result<Vec<QueryRow>, QueryError> {
        self.stats.runs.fetch_add(1, Ordering::SeqCst);
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_active.fetch_max(active, Ordering::SeqCst);

        let result = match &self.script {
            Script::Rows(rows) => Ok(rows.clone()),
            Script::Fail => Err(QueryError::Database(
                "relation \"aircraft_positions\" does not exist".to_string(),
            )),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
            Script::Slow(delay, rows) => {
                tokio::time::sleep(*delay).await;
                Ok(rows.clone())
            }
            Script::FaultThenRows(rows) => {
                faults.report(ConnectionFault::Closed(
                    "server closed the connection unexpectedly".to_string(),
                ));
                Ok(rows.clone())
            }
            Script::RowsThenFault(rows) => {
                let stats = Arc::clone(&self.stats);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let settled = faults.report(ConnectionFault::Broken);
                    *stats.late_fault_settled.lock().unwrap() = Some(settled);
                });
                Ok(rows.clone())
            }
            Script::Panic => panic!("executor bug: row decoder out of sync"),
        };

        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        drop(conn);
        result
    }
}

#[derive(Default)]
pub struct RecordingRenderer {
    views: Mutex<Vec<ViewModel>>,
}

impl RecordingRenderer {
    pub fn views(&self) -> Vec<ViewModel> {
        self.views.lock().unwrap().clone()
    }
}

impl Render for RecordingRenderer {
    fn render(&self, view: &ViewModel) -> Result<String, RenderError> {
        self.views.lock().unwrap().push(view.clone());
        Ok(format!("{} rows: {}", view.rows.len(), view.status))
    }
}

pub type TestDashboard = Dashboard<FakeManager, ScriptedExecutor, Arc<RecordingRenderer>>;

pub struct Harness {
    pub dashboard: Arc<TestDashboard>,
    pub renderer: Arc<RecordingRenderer>,
    pub database: Arc<FakeDatabase>,
    pub executor: Arc<ExecutorStats>,
}

pub fn harness(script: Script, pool_size: u32, acquire_timeout: Duration) -> Harness {
    let (pool, database) = fake_pool(pool_size, acquire_timeout);
    let (executor, executor_stats) = ScriptedExecutor::new(script);
    let renderer = Arc::new(RecordingRenderer::default());
    let settings = QuerySettings {
        period: PERIOD,
        deadline: DEADLINE,
    };

    Harness {
        dashboard: Arc::new(Dashboard::new(pool, executor, Arc::clone(&renderer), settings)),
        renderer,
        database,
        executor: executor_stats,
    }
}

pub fn row(callsign: &str, hex: &str, age_secs: i64) -> QueryRow {
    QueryRow {
        callsign: callsign.to_string(),
        airline: Some("KLM Royal Dutch Airlines".to_string()),
        country: Some("Netherlands".to_string()),
        hex: hex.to_string(),
        altitude_ft: Some(31000),
        latitude: 52.31,
        longitude: 4.76,
        heading_deg: Some(180),
        speed_kt: Some(440),
        age_secs,
    }
}
