use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use r2d2::ManageConnection;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::config::{Config, ConfigError};
use crate::handler::Dashboard;
use crate::pool::PgPool;
use crate::query::{PgFlightQuery, QueryExecutor, QuerySettings};
use crate::render::{Render, RenderError, TeraRenderer};

/// Fatal errors while constructing or running the server
#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot load templates: {0}")]
    Templates(#[from] RenderError),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot install metrics recorder: {0}")]
    Metrics(String),

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

async fn flight_board<M, Q, R>(State(dashboard): State<Arc<Dashboard<M, Q, R>>>) -> Response
where
    M: ManageConnection,
    Q: QueryExecutor<M>,
    R: Render,
{
    let handled = dashboard.handle().await;
    match handled.page {
        Ok(html) => Html(html).into_response(),
        // Never leak template internals to the client
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response(),
    }
}

// Access log, one line per request. Server errors are also sent to Sentry.
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start_time = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let elapsed_ms = start_time.elapsed().as_secs_f64() * 1000.0;
    if status.is_server_error() {
        error!("{} {} {} {:.2}ms", method, path, status.as_u16(), elapsed_ms);
        sentry::with_scope(
            |scope| {
                scope.set_tag("http.method", method.as_str());
                scope.set_tag("http.path", &path);
                scope.set_tag("http.status_code", status.as_u16().to_string());
            },
            || {
                sentry::capture_message(
                    &format!("Flight board returned {} for {}", status.as_u16(), path),
                    sentry::Level::Error,
                )
            },
        );
    } else {
        info!("{} {} {} {:.2}ms", method, path, status.as_u16(), elapsed_ms);
    }

    response
}

/// The board at `/`, static assets under `/public`.
pub fn router<M, Q, R>(dashboard: Arc<Dashboard<M, Q, R>>, public_dir: &Path) -> Router
where
    M: ManageConnection,
    Q: QueryExecutor<M>,
    R: Render,
{
    Router::new()
        .route("/", get(flight_board::<M, Q, R>))
        .nest_service("/public", ServeDir::new(public_dir))
        .with_state(dashboard)
        .layer(middleware::from_fn(request_logging_middleware))
}

/// Construct everything from a validated config, bind, and serve until a
/// shutdown signal arrives.
pub async fn run(config: Config) -> Result<(), InitError> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "web-server");
    });

    let addr = config.bind_address()?;
    let renderer = TeraRenderer::load(&config.html.views)?;

    if let Some(port) = config.metrics.port {
        let handle = crate::metrics::init_metrics()?;
        crate::metrics::initialize_flight_metrics();
        let metrics_addr = SocketAddr::new(addr.ip(), port);
        let listener = TcpListener::bind(metrics_addr)
            .await
            .map_err(|source| InitError::Bind {
                addr: metrics_addr,
                source,
            })?;
        info!("Metrics server listening on http://{}", metrics_addr);
        tokio::spawn(crate::metrics::serve_metrics(listener, handle));
    }

    let pool = PgPool::connect(&config.database);
    info!(
        "Connection pool for {}@{}:{}/{} (limit {})",
        config.database.user,
        config.database.host,
        config.database.port,
        config.database.database,
        pool.limit()
    );

    let dashboard = Arc::new(Dashboard::new(
        pool,
        PgFlightQuery,
        renderer,
        QuerySettings::from(&config.query),
    ));
    let app = router(dashboard, &config.html.public);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| InitError::Bind { addr, source })?;
    info!("Flight board listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(InitError::Serve)?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Detected Ctrl-C; shutting down"),
        _ = terminate => info!("Received SIGTERM; shutting down"),
    }
}
