use crate::gateway_logic::config::Config;
use crate::gateway_logic::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use lib_gateway::broker::ClientFormat;
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::sync::broadcast;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub legacy: bool,
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws/{tenant}", get(ws_handler))
        .route("/targets/{tenant}", get(targets_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

pub async fn run(
    config: Config,
    app_state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(tenant): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let format = if params.legacy {
        ClientFormat::Legacy
    } else {
        ClientFormat::Current
    };
    ws.on_upgrade(move |socket| handle_socket(socket, tenant, format, state))
}

async fn targets_handler(Path(tenant): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    Json(state.resolver.active_targets(&tenant))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn handle_socket(mut socket: WebSocket, tenant: String, format: ClientFormat, state: AppState) {
    let mut handle = state.broker.client(&tenant, format);
    let client_id = handle.client_id();
    log::info!("Client {} connected to tenant {} ({:?})", client_id, tenant, format);

    // Make sure the tenant owns targets; abandoned if the socket closes first.
    let allocator = state.allocator.clone();
    let lookup_tenant = tenant.clone();
    let lookup = async move { allocator.lookup(&lookup_tenant).await };
    tokio::pin!(lookup);
    let mut lookup_done = false;

    loop {
        tokio::select! {
            result = &mut lookup, if !lookup_done => {
                lookup_done = true;
                match result {
                    Ok(url) => log::info!("Tenant {} routed to {} for client {}", tenant, url, client_id),
                    Err(e) => log::warn!("Target lookup for tenant {} failed: {}", tenant, e),
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => handle.handle_text(text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("Client {} socket error: {}", client_id, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            Some(message) = handle.recv() => {
                if socket.send(Message::Text(message.to_text().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    log::info!("Client {} disconnected from tenant {}", client_id, tenant);
}
