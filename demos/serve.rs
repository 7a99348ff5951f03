use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use axum::routing::any;
use axum::Router;

use axum_send::{serve, SendConfig};

#[derive(Debug, Clone)]
struct AppState {
    root: Arc<PathBuf>,
    config: Arc<SendConfig>,
}

/// Serves the directory given as the first argument (default `test`).
///
/// Settings are read as JSON from `SEND_CONFIG`, e.g.
/// `SEND_CONFIG='{"max_age": 3600, "compression_threshold": 512}'`.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let root = std::env::args().nth(1).map_or_else(|| PathBuf::from("test"), PathBuf::from);
    let config = match std::env::var("SEND_CONFIG") {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring invalid SEND_CONFIG");
            SendConfig::default()
        }),
        Err(_) => SendConfig::default(),
    };
    tracing::info!(root = %root.display(), ?config, "serving");

    let state = AppState {
        root: Arc::new(root),
        config: Arc::new(config),
    };
    let _app: Router<()> = Router::new()
        .route("/", any(file))
        .route("/{*path}", any(file))
        .with_state(state);

    #[cfg(feature = "run_server_in_example")]
    {
        let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
        axum::serve(listener, _app).await.unwrap();
    }
}

async fn file(State(state): State<AppState>, method: Method, uri: Uri, headers: HeaderMap) -> Response {
    serve(&state.root, &method, &headers, uri.path(), &state.config).await
}
