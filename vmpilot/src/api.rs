//! HTTP surface of `vmpilotd`
//!
//! | route | |
//! |---|---|
//! | `GET /ping` | liveness, answers `{"message":"pong"}` |
//! | `POST /vms` | provision a VM from a [PostVmRequest] |
//! | `GET /vms/{name}/console` | WebSocket attached to the VM serial console |
use std::{fmt, io, path::PathBuf, sync::Arc};

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{future, SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, instrument, warn};
use vmpilot_models::models::PostVmRequest;

use crate::{
    builder::{spec::VmSpecBuilder, Builder},
    console::{relay, ConsoleRelay, RelayError},
    hypervisor::{ConsoleStream, HypervisorError},
    provision::Provisioner,
};

/// Values applied to every request
#[derive(Debug, Clone)]
pub struct RequestDefaults {
    pub base_image: PathBuf,
    pub bridge: String,
}

#[derive(Clone)]
pub struct AppState {
    pub provisioner: Arc<Provisioner>,
    pub relay: ConsoleRelay,
    pub defaults: RequestDefaults,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("provisioner", &self.provisioner)
            .field("relay", &self.relay)
            .field("defaults", &self.defaults)
            .finish()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/vms", post(create_vm))
        .route("/vms/{name}/console", get(console))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }
    axum::serve(listener, router(state)).await
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "message": "pong" }))
}

#[instrument(skip_all)]
async fn create_vm(
    State(app): State<AppState>,
    request: Result<Json<PostVmRequest>, JsonRejection>,
) -> Response {
    let request = match request {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Malformed request: {}", rejection);
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    let spec = VmSpecBuilder::new()
        .with_memory_gb(request.resources.memory)
        .with_vcpus(request.resources.vcpus)
        .with_disk_gb(request.resources.disk)
        .with_password(request.cloud_init.password)
        .with_ip_address(request.cloud_init.ip_address)
        .with_gateway(request.cloud_init.gateway)
        .with_script(request.cloud_init.script)
        .with_bridge(app.defaults.bridge.clone())
        .with_base_image(app.defaults.base_image.clone())
        .try_build();
    let spec = match spec {
        Ok(spec) => spec,
        Err(e) => {
            warn!("Rejected request: {}", e);
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match app.provisioner.provision(&spec).await {
        Ok(name) => (
            StatusCode::OK,
            Json(json!({ "status": "VM created successfully", "vm_name": name })),
        )
            .into_response(),
        Err(e) => {
            error!("{}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn relay_status(e: &RelayError) -> StatusCode {
    match e {
        RelayError::NotRunning { .. } => StatusCode::CONFLICT,
        RelayError::Hypervisor(HypervisorError::NotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[instrument(skip(app, ws))]
async fn console(
    State(app): State<AppState>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let console = match app.relay.open(&name).await {
        Ok(console) => console,
        Err(e) => {
            warn!("Console unavailable: {}", e);
            return error_response(relay_status(&e), e.to_string());
        }
    };
    ws.on_upgrade(move |socket| relay_socket(name, console, socket))
}

/// Run the relay over a WebSocket, text frames only
async fn relay_socket(name: String, console: ConsoleStream, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let client_tx =
        sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text.into()))));
    let client_rx = stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    });
    let end = relay(console, client_tx, client_rx).await;
    info!("Console session of {} closed: {}", name, end);
}
