use crate::backend::BackendLink;
use crate::errors::{ErrorBody, RelayError, RelayResult};
use crate::models::{
    ClientEntry, KeyRegistration, KeyRevocation, PermissionEntry, RegisterKeyRequest,
    StatusResponse,
};
use crate::registry::ConnectionRegistry;
use crate::session::{self, close_code, CloseReason, SessionConfig};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, RawQuery, State};
use axum::response::Response;
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use utoipa::OpenApi as UtoipaOpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(
        liveness,
        status,
        register_api_key,
        revoke_api_key,
        list_clients,
        list_permissions,
        assign_control,
        release_control,
    ),
    components(schemas(
        StatusResponse,
        RegisterKeyRequest,
        KeyRegistration,
        KeyRevocation,
        ClientEntry,
        PermissionEntry,
        ErrorBody
    )),
    tags((name = "relay", description = "Manage viewers of the relayed VNC desktop"))
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub backend: BackendLink,
    pub registry: ConnectionRegistry,
    pub session: SessionConfig,
}

pub fn build_router(
    backend: BackendLink,
    registry: ConnectionRegistry,
    session: SessionConfig,
) -> Router {
    let state = AppState {
        backend,
        registry,
        session,
    };
    let openapi = ApiDoc::openapi();
    let swagger_routes: Router<AppState> =
        SwaggerUi::new("/docs").url("/openapi.json", openapi).into();

    Router::new()
        .route("/", get(liveness))
        .route("/status", get(status))
        .route("/apiKeys/register", post(register_api_key))
        .route("/apiKeys/{apiKey}", delete(revoke_api_key))
        .route("/clients", get(list_clients))
        .route("/clients/permissions", get(list_permissions))
        .route(
            "/clients/{clientId}/control",
            post(assign_control).delete(release_control),
        )
        // Viewer endpoint: one WebSocket connection per viewer session.
        .route("/vnc", any(vnc_websocket))
        .merge(swagger_routes)
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Relay is alive"))
)]
async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

#[utoipa::path(
    get,
    path = "/status",
    responses((status = 200, description = "Backend and viewer status", body = StatusResponse))
)]
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let vnc = state.backend.status().await;
    let snapshot = state.registry.snapshot().await;
    Json(StatusResponse {
        is_connected: vnc.connected,
        host: vnc.host,
        port: vnc.port,
        width: vnc.width,
        height: vnc.height,
        desktop_name: vnc.desktop_name,
        error: vnc.error,
        client_count: snapshot.client_count,
        current_controller: snapshot.controller,
        max_connections: snapshot.max_connections,
    })
}

#[utoipa::path(
    post,
    path = "/apiKeys/register",
    request_body = RegisterKeyRequest,
    responses(
        (status = 200, description = "Key registered (idempotent)", body = KeyRegistration),
        (status = 400, description = "Empty key", body = ErrorBody)
    )
)]
async fn register_api_key(
    State(state): State<AppState>,
    Json(request): Json<RegisterKeyRequest>,
) -> RelayResult<Json<KeyRegistration>> {
    if request.api_key.trim().is_empty() {
        return Err(RelayError::InvalidRequest("apiKey must not be empty".into()));
    }
    let created = state.registry.register_key(&request.api_key).await;
    Ok(Json(KeyRegistration {
        api_key: request.api_key,
        created,
    }))
}

#[utoipa::path(
    delete,
    path = "/apiKeys/{apiKey}",
    params(("apiKey" = String, Path, description = "Key to revoke")),
    responses(
        (status = 200, description = "Key revoked and its sessions closed", body = KeyRevocation),
        (status = 404, description = "Unknown key", body = ErrorBody)
    )
)]
async fn revoke_api_key(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
) -> RelayResult<Json<KeyRevocation>> {
    let sessions_closed = state.registry.revoke_key(&api_key).await?;
    Ok(Json(KeyRevocation {
        api_key,
        sessions_closed,
    }))
}

#[utoipa::path(
    get,
    path = "/clients",
    responses((status = 200, description = "Connected and pre-configured clients", body = [ClientEntry]))
)]
async fn list_clients(State(state): State<AppState>) -> Json<Vec<ClientEntry>> {
    Json(state.registry.list_clients().await)
}

#[utoipa::path(
    get,
    path = "/clients/permissions",
    responses((status = 200, description = "Stored control grants for offline clients", body = [PermissionEntry]))
)]
async fn list_permissions(State(state): State<AppState>) -> Json<Vec<PermissionEntry>> {
    Json(state.registry.list_permissions().await)
}

#[utoipa::path(
    post,
    path = "/clients/{clientId}/control",
    params(("clientId" = String, Path, description = "Client to grant control to")),
    responses((status = 200, description = "Control assigned, or stored until the client connects", body = ClientEntry))
)]
async fn assign_control(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Json<ClientEntry> {
    Json(state.registry.assign_control(&client_id).await)
}

#[utoipa::path(
    delete,
    path = "/clients/{clientId}/control",
    params(("clientId" = String, Path, description = "Client to release control from")),
    responses(
        (status = 200, description = "Control released or stored grant deleted", body = ClientEntry),
        (status = 404, description = "Client holds no control grant", body = ErrorBody)
    )
)]
async fn release_control(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> RelayResult<Json<ClientEntry>> {
    let entry = state.registry.release_control(&client_id).await?;
    Ok(Json(entry))
}

async fn vnc_websocket(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let params = parse_viewer_params(query.as_deref());
    ws.on_upgrade(move |socket| async move {
        match params {
            Ok((client_id, api_key)) => {
                session::serve(
                    socket,
                    client_id,
                    api_key,
                    state.backend.clone(),
                    state.registry.clone(),
                    state.session.clone(),
                )
                .await;
            }
            Err(reason) => session::reject(socket, reason).await,
        }
    })
}

/// Extracts `clientId` and `apiKey` from the query string. Both must be
/// present exactly once; repeated parameters are rejected rather than picking
/// one arbitrarily.
fn parse_viewer_params(query: Option<&str>) -> Result<(String, String), CloseReason> {
    let mut client_id: Option<String> = None;
    let mut api_key: Option<String> = None;

    for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        let slot = match key.as_ref() {
            "clientId" => &mut client_id,
            "apiKey" => &mut api_key,
            _ => continue,
        };
        if slot.replace(value.into_owned()).is_some() {
            return Err(CloseReason {
                code: close_code::INVALID_PARAMS,
                reason: "duplicate connection parameter",
            });
        }
    }

    match (client_id, api_key) {
        (Some(client_id), Some(api_key)) if !client_id.is_empty() && !api_key.is_empty() => {
            Ok((client_id, api_key))
        }
        _ => Err(CloseReason {
            code: close_code::INVALID_PARAMS,
            reason: "clientId and apiKey are required",
        }),
    }
}
