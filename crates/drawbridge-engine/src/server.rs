//! Axum-based HTTP and WebSocket server.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::connection::handle_viewer;
use crate::routes;
use crate::state::EngineState;

/// All engine routes, with CORS and request tracing applied.
pub fn build_router(state: Arc<EngineState>) -> Router {
    let router = Router::new()
        .route("/health", get(routes::health))
        .route(
            "/api/elements",
            get(routes::list_elements)
                .post(routes::create_element)
                .delete(routes::clear_elements),
        )
        .route("/api/elements/search", get(routes::search_elements))
        .route("/api/elements/batch", post(routes::batch_create))
        .route("/api/elements/sync", post(routes::sync_elements))
        .route(
            "/api/elements/{id}",
            get(routes::get_element)
                .put(routes::update_element)
                .delete(routes::delete_element),
        )
        .route("/api/import", post(routes::import_scene))
        .route("/api/export/svg", get(routes::export_svg))
        .route("/api/export/json", get(routes::export_json))
        .route("/api/scene", get(routes::scene))
        .route("/api/sync/status", get(routes::sync_status))
        .route("/ws", get(ws_handler))
        .with_state(state);

    #[cfg(feature = "metrics")]
    let router = router.layer(axum::middleware::from_fn(crate::metrics::track_requests));

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind the configured address and serve until SIGINT/SIGTERM.
pub async fn start_engine(state: Arc<EngineState>) -> anyhow::Result<()> {
    let addr = state.config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Canvas engine listening on {addr}");
    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<EngineState>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    #[allow(unused_mut)]
    let mut app = build_router(state);

    #[cfg(feature = "metrics")]
    match crate::metrics::install_prometheus_recorder() {
        Ok(handle) => {
            app = app.route(
                "/metrics",
                get(move || std::future::ready(handle.render())),
            );
            info!("Prometheus metrics available at /metrics");
        }
        Err(e) => warn!(error = %e, "Metrics recorder not installed"),
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Canvas engine stopped");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer(state, socket))
}

/// Resolves on Ctrl+C, or on SIGTERM from a supervising process.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
