//! Per-request pipeline: acquire a lease, run the window query, build the
//! view, release the lease, render.
//!
//! Each request walks the [`HandlerState`] graph exactly once. The query task
//! and the lease's fault channel race into a single [`Completion`]; whichever
//! fires first decides the outcome and the other is ignored.

use chrono::Utc;
use r2d2::ManageConnection;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, error, info_span, warn};
use uuid::Uuid;

use crate::completion::{Completion, Signal};
use crate::pool::{ConnectionPool, Lease};
use crate::query::{QueryError, QueryExecutor, QuerySettings};
use crate::render::{Render, RenderError};
use crate::view::{COLUMNS, Column, DegradedReason, ViewModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Acquiring,
    AcquireFailed,
    Acquired,
    Querying,
    QuerySucceeded,
    QueryFailed,
    ConnectionFaulted,
    Finalizing,
    Done,
}

impl HandlerState {
    pub fn can_advance_to(self, next: HandlerState) -> bool {
        use HandlerState::*;
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Acquiring, AcquireFailed | Acquired)
                | (AcquireFailed, Done)
                | (Acquired, Querying)
                | (Querying, QuerySucceeded | QueryFailed | ConnectionFaulted)
                | (QuerySucceeded | QueryFailed | ConnectionFaulted, Finalizing)
                | (Finalizing, Done)
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid request transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: HandlerState,
    pub to: HandlerState,
}

/// Path a single request took through [`HandlerState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    path: Vec<HandlerState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            path: vec![HandlerState::Idle],
        }
    }

    pub fn current(&self) -> HandlerState {
        self.path.last().copied().unwrap_or(HandlerState::Idle)
    }

    pub fn advance(&mut self, next: HandlerState) -> Result<(), InvalidTransition> {
        let from = self.current();
        if !from.can_advance_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.path.push(next);
        Ok(())
    }

    pub fn path(&self) -> &[HandlerState] {
        &self.path
    }

    /// The state that decided the response: how acquisition or the query ended
    pub fn outcome(&self) -> Option<HandlerState> {
        self.path.iter().copied().find(|state| {
            matches!(
                state,
                HandlerState::AcquireFailed
                    | HandlerState::QuerySucceeded
                    | HandlerState::QueryFailed
                    | HandlerState::ConnectionFaulted
            )
        })
    }
}

/// Result of one request
#[derive(Debug)]
pub struct HandledRequest {
    pub lifecycle: Lifecycle,
    pub page: Result<String, RenderError>,
}

/// Aborts the query task if the request finishes (or is dropped) first
struct QueryTask(Option<JoinHandle<()>>);

impl QueryTask {
    /// Resolves once the task has ended, whether or not it fired its signal.
    /// Never resolves when no task was spawned.
    async fn finished(&mut self) -> Result<(), JoinError> {
        match self.0.as_mut() {
            Some(handle) => {
                let joined = handle.await;
                self.0 = None;
                joined
            }
            None => std::future::pending().await,
        }
    }
}

impl Drop for QueryTask {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Everything a request needs, constructed once at startup and shared by all
/// requests.
pub struct Dashboard<M: ManageConnection, Q, R> {
    pool: ConnectionPool<M>,
    executor: Arc<Q>,
    renderer: R,
    settings: QuerySettings,
    columns: &'static [Column],
}

impl<M, Q, R> Dashboard<M, Q, R>
where
    M: ManageConnection,
    Q: QueryExecutor<M>,
    R: Render,
{
    pub fn new(pool: ConnectionPool<M>, executor: Q, renderer: R, settings: QuerySettings) -> Self {
        Self {
            pool,
            executor: Arc::new(executor),
            renderer,
            settings,
            columns: COLUMNS,
        }
    }

    pub fn pool(&self) -> &ConnectionPool<M> {
        &self.pool
    }

    /// Serve one request. Always produces exactly one rendered view; the
    /// lease, if one was acquired, is released exactly once before rendering.
    pub async fn handle(&self) -> HandledRequest {
        let request_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        self.handle_inner()
            .instrument(info_span!("request", id = %request_id))
            .await
    }

    async fn handle_inner(&self) -> HandledRequest {
        metrics::counter!("flight_requests_total").increment(1);
        let mut lifecycle = Lifecycle::new();

        advance(&mut lifecycle, HandlerState::Acquiring);
        let mut lease = match self.pool.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Cannot acquire database connection: {}", e);
                advance(&mut lifecycle, HandlerState::AcquireFailed);
                let view = ViewModel::degraded(self.columns, DegradedReason::NoConnection);
                let page = self.render(&view);
                advance(&mut lifecycle, HandlerState::Done);
                return HandledRequest { lifecycle, page };
            }
        };
        advance(&mut lifecycle, HandlerState::Acquired);

        let (completion, mut settled) = Completion::new();
        let mut query_task = self.spawn_query(&mut lease, &completion);
        advance(&mut lifecycle, HandlerState::Querying);

        let ended = tokio::select! {
            biased;
            signal = &mut settled => Ok(signal),
            joined = query_task.finished() => Err(joined),
        };
        drop(query_task);

        let signal = match ended {
            Ok(signal) => signal,
            Err(joined) => {
                // A task that panicked, or returned without firing, still settles the request
                let reason = match joined {
                    Ok(()) => "query task ended without settling".to_string(),
                    Err(e) => format!("query task failed: {e}"),
                };
                completion.fire(Signal::Query(Err(QueryError::Interrupted(reason))));
                settled.await
            }
        }
        .unwrap_or_else(|_| {
            Signal::Query(Err(QueryError::Interrupted(
                "completion closed without a signal".to_string(),
            )))
        });

        let view = match signal {
            Signal::Query(Ok(rows)) => {
                advance(&mut lifecycle, HandlerState::QuerySucceeded);
                ViewModel::build(rows, self.columns, Utc::now())
            }
            Signal::Query(Err(e)) => {
                advance(&mut lifecycle, HandlerState::QueryFailed);
                let reason = match e {
                    QueryError::DeadlineExceeded(_) => {
                        metrics::counter!("flight_query_timeouts_total").increment(1);
                        DegradedReason::QueryTimedOut
                    }
                    _ => DegradedReason::QueryFailed,
                };
                metrics::counter!("flight_query_failed_total").increment(1);
                warn!(lease = lease.id(), "Window query failed: {}", e);
                ViewModel::degraded(self.columns, reason)
            }
            Signal::Fault(fault) => {
                advance(&mut lifecycle, HandlerState::ConnectionFaulted);
                metrics::counter!("flight_connection_faults_total").increment(1);
                warn!(lease = lease.id(), "Connection fault: {}", fault);
                ViewModel::degraded(self.columns, DegradedReason::ConnectionLost)
            }
        };

        advance(&mut lifecycle, HandlerState::Finalizing);
        self.pool.release(lease);
        let page = self.render(&view);
        advance(&mut lifecycle, HandlerState::Done);

        HandledRequest { lifecycle, page }
    }

    fn spawn_query(&self, lease: &mut Lease<M>, completion: &Completion) -> QueryTask {
        let Some((conn, faults)) = lease.checkout(completion) else {
            completion.fire(Signal::Query(Err(QueryError::Interrupted(
                "lease has no connection".to_string(),
            ))));
            return QueryTask(None);
        };

        let executor = Arc::clone(&self.executor);
        let completion = completion.clone();
        let settings = self.settings;
        let handle = tokio::spawn(
            async move {
                let result = executor.execute(conn, faults, settings).await;
                completion.fire(Signal::Query(result));
            }
            .in_current_span(),
        );
        QueryTask(Some(handle))
    }

    fn render(&self, view: &ViewModel) -> Result<String, RenderError> {
        self.renderer.render(view).inspect_err(|e| {
            error!("Failed to render flight board: {}", e);
        })
    }
}

fn advance(lifecycle: &mut Lifecycle, next: HandlerState) {
    if let Err(e) = lifecycle.advance(next) {
        error!("{}", e);
        debug_assert!(false, "{e}");
    }
}
