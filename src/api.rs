//! HTTP and WebSocket surface.
//!
//! All JSON, all versionless under `/api`. Handlers translate tagged
//! errors into status codes; the `no_root_spots` back-pressure signal is a
//! 409 so the sending side can restore silently. WebSocket clients get
//! binary state frames out and send `{command, data?}` text frames in;
//! protocol violations (invalid JSON, over-quota) close the connection
//! with a policy-violation code, anything else is answered in-band.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ErrorCode;
use crate::manager::CreateWorldOptions;
use crate::protocol::{ClientCommand, RemoteTransferRequest, TransferredEntity};
use crate::runner::short;
use crate::security::{discovery_key_ok, validate_server_host};
use crate::startup::AppContext;
use crate::types::{Connection, ServerInfo, ServerStatus, TransferRecord, WorldId};

/// WebSocket close code for policy violations.
const WS_POLICY_VIOLATION: u16 = 1008;

// ---------------------------------------------------------------------------
// Error responses
// ---------------------------------------------------------------------------

struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = if ctx.config.production {
        let origins: Vec<axum::http::HeaderValue> = ctx
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::permissive()
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/servers/local", get(local_server))
        .route("/api/worlds", get(list_worlds).post(create_world))
        .route("/api/worlds/types", get(world_types))
        .route("/api/worlds/:world_id", get(get_world).delete(delete_world))
        .route("/api/worlds/:world_id/step", post(step_world))
        .route("/api/worlds/:world_id/save", post(save_world))
        .route("/api/worlds/:world_id/snapshots", get(list_snapshots))
        .route("/api/worlds/:world_id/transfer", post(local_transfer))
        .route("/api/connections", get(list_connections).post(create_connection))
        .route("/api/connections/:connection_id", delete(delete_connection))
        .route("/api/remote-transfer", post(remote_transfer))
        .route("/api/transfers", get(list_transfers))
        .route("/api/transfers/:transfer_id", get(get_transfer))
        .route("/api/discovery/register", post(discovery_register))
        .route("/api/discovery/heartbeat/:server_id", post(discovery_heartbeat))
        .route("/api/discovery/servers", get(discovery_servers))
        .route("/api/discovery/unregister/:server_id", delete(discovery_unregister))
        .route("/ws", get(ws_default))
        .route("/ws/:world_id", get(ws_world))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Health & server info
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn local_server(State(ctx): State<Arc<AppContext>>) -> Json<ServerInfo> {
    Json(ctx.local_server_info())
}

// ---------------------------------------------------------------------------
// Worlds
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateWorldRequest {
    world_type: String,
    name: String,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default = "default_persistent")]
    persistent: bool,
    #[serde(default)]
    description: String,
}

fn default_persistent() -> bool {
    true
}

async fn create_world(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<CreateWorldRequest>,
) -> ApiResult<Response> {
    let instance = ctx
        .manager
        .create(
            &request.world_type,
            request.name.clone(),
            CreateWorldOptions {
                config: request.config,
                seed: request.seed,
                persistent: request.persistent,
                description: request.description,
            },
        )
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    instance.runner.start(false);
    ctx.hub.register(instance.runner.clone());

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "world_id": instance.world_id,
            "world_type": instance.world_type,
            "mode_id": instance.mode_id,
            "name": instance.name,
            "view_mode": instance.runner.view_mode(),
            "persistent": instance.persistent,
            "message": format!("World '{}' created", instance.name),
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct ListWorldsQuery {
    #[serde(default)]
    world_type: Option<String>,
}

async fn list_worlds(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListWorldsQuery>,
) -> Json<Value> {
    let worlds = ctx.manager.list(query.world_type.as_deref());
    Json(json!({ "count": worlds.len(), "worlds": worlds }))
}

async fn world_types() -> Json<Value> {
    let types = crate::backend::world_type_registry();
    Json(json!({ "count": types.len(), "world_types": types }))
}

async fn get_world(
    State(ctx): State<Arc<AppContext>>,
    Path(world_id): Path<WorldId>,
) -> ApiResult<Json<Value>> {
    let instance = ctx
        .manager
        .get(&world_id)
        .ok_or_else(|| ApiError::not_found(format!("World not found: {}", world_id)))?;
    Ok(Json(serde_json::to_value(instance.status()).unwrap_or_default()))
}

async fn delete_world(
    State(ctx): State<Arc<AppContext>>,
    Path(world_id): Path<WorldId>,
) -> ApiResult<Json<Value>> {
    let instance = ctx
        .manager
        .delete(&world_id)
        .ok_or_else(|| ApiError::not_found(format!("World not found: {}", world_id)))?;

    instance.runner.stop().await;
    ctx.hub.remove_world(&world_id);
    let cleared = ctx.connections.clear_for_world(&world_id);
    if cleared > 0 {
        ctx.connections.save();
    }
    Ok(Json(json!({
        "message": format!("World {} deleted", short(&world_id)),
        "connections_removed": cleared,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct StepRequest {
    #[serde(default)]
    actions: Option<Value>,
}

async fn step_world(
    State(ctx): State<Arc<AppContext>>,
    Path(world_id): Path<WorldId>,
    body: Option<Json<StepRequest>>,
) -> ApiResult<Json<Value>> {
    let instance = ctx
        .manager
        .get(&world_id)
        .ok_or_else(|| ApiError::not_found(format!("World not found: {}", world_id)))?;
    let actions = body.and_then(|Json(b)| b.actions);
    let frame = instance
        .runner
        .step(actions.as_ref())
        .map_err(|e| ApiError::new(StatusCode::CONFLICT, e.message))?;
    Ok(Json(json!({ "world_id": world_id, "frame_count": frame })))
}

async fn save_world(
    State(ctx): State<Arc<AppContext>>,
    Path(world_id): Path<WorldId>,
) -> ApiResult<Json<Value>> {
    if ctx.manager.get(&world_id).is_none() {
        return Err(ApiError::not_found(format!("World not found: {}", world_id)));
    }
    match ctx.autosave.save_world_now(&world_id) {
        Some(path) => Ok(Json(json!({
            "message": "Snapshot saved",
            "snapshot_path": path.to_string_lossy(),
        }))),
        None => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to save snapshot",
        )),
    }
}

async fn list_snapshots(
    State(ctx): State<Arc<AppContext>>,
    Path(world_id): Path<WorldId>,
) -> ApiResult<Json<Value>> {
    if ctx.manager.get(&world_id).is_none() {
        return Err(ApiError::not_found(format!("World not found: {}", world_id)));
    }
    let snapshots = ctx.snapshots.list(&world_id);
    Ok(Json(json!({ "count": snapshots.len(), "snapshots": snapshots })))
}

// ---------------------------------------------------------------------------
// Local transfer (server-internal)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LocalTransferQuery {
    entity_id: String,
    destination_world_id: WorldId,
}

async fn local_transfer(
    State(ctx): State<Arc<AppContext>>,
    Path(source_world_id): Path<WorldId>,
    Query(query): Query<LocalTransferQuery>,
) -> ApiResult<Json<Value>> {
    let source = ctx.manager.get(&source_world_id).ok_or_else(|| {
        ApiError::not_found(format!("Source world not found: {}", source_world_id))
    })?;
    let dest = ctx.manager.get(&query.destination_world_id).ok_or_else(|| {
        ApiError::not_found(format!(
            "Destination world not found: {}",
            query.destination_world_id
        ))
    })?;
    for world in [&source, &dest] {
        if !world.allow_transfers {
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                format!("World '{}' does not allow entity transfers", world.name),
            ));
        }
    }

    // Serialize the entity out of the source.
    let registry = ctx.registry.clone();
    let entity_id = query.entity_id.clone();
    let serialized = source.runner.with_backend(move |backend| {
        let entity = backend.entity(&entity_id)?;
        Some(registry.try_serialize(entity, &Default::default()))
    });
    let data = match serialized {
        None => {
            return Err(ApiError::not_found(format!(
                "Entity not found in source world: {}",
                query.entity_id
            )))
        }
        Some(Err(e)) => return Err(ApiError::bad_request(e.message)),
        Some(Ok(data)) => Value::Object(data),
    };
    let entity_type = data
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let energy = data.get("energy").and_then(Value::as_f64).unwrap_or(0.0);

    // Destination first, then remove from the source.
    let registry = ctx.registry.clone();
    let commit_data = data.clone();
    let commit = dest
        .runner
        .with_backend(move |backend| registry.try_deserialize(&commit_data, backend));
    let new_id = match commit {
        Err(e) if e.code == ErrorCode::NoRootSpots => {
            return Err(ApiError {
                status: StatusCode::CONFLICT,
                body: json!({
                    "error": ErrorCode::NoRootSpots.as_str(),
                    "message": "No available root spots in destination",
                }),
            });
        }
        Err(e) => {
            log_api_transfer(&ctx, &entity_type, &query.entity_id, None, &source.world_id,
                &source.name, &dest.world_id, &dest.name, false, Some(e.message.clone()));
            return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.message));
        }
        Ok(new_id) => new_id,
    };

    let is_fish = entity_type == "fish";
    let entity_id = query.entity_id.clone();
    source.runner.with_backend(move |backend| {
        if backend.remove(&entity_id).is_some() && is_fish {
            backend.record_energy_burn("migration", energy);
        }
    });
    if is_fish {
        dest.runner
            .with_backend(|backend| backend.record_energy_gain("migration_in", energy));
    }
    source.runner.invalidate_cache();
    dest.runner.invalidate_cache();

    log_api_transfer(&ctx, &entity_type, &query.entity_id, Some(new_id.clone()),
        &source.world_id, &source.name, &dest.world_id, &dest.name, true, None);

    Ok(Json(json!({
        "success": true,
        "message": "Entity transferred successfully",
        "entity": {
            "old_id": query.entity_id,
            "new_id": new_id,
            "type": entity_type,
            "source_world": source.world_id,
            "destination_world": dest.world_id,
        },
    })))
}

// ---------------------------------------------------------------------------
// Remote transfer (peer-facing)
// ---------------------------------------------------------------------------

async fn remote_transfer(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<RemoteTransferRequest>,
) -> ApiResult<Json<Value>> {
    let remote_source_id = format!("{}:{}", request.source_server_id, request.source_world_id);
    let remote_source_name = format!("Remote world on {}", request.source_server_id);

    let dest = ctx.manager.get(&request.destination_world_id).ok_or_else(|| {
        ApiError::not_found(format!(
            "Destination world not found: {}",
            request.destination_world_id
        ))
    })?;
    if !dest.allow_transfers {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            format!("World '{}' does not allow entity transfers", dest.name),
        ));
    }

    let old_id = request
        .entity_data
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("?")
        .to_string();
    let entity_type = request
        .entity_data
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let energy = request
        .entity_data
        .get("energy")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let registry = ctx.registry.clone();
    let data = request.entity_data.clone();
    let outcome = dest
        .runner
        .with_backend(move |backend| registry.try_deserialize(&data, backend));

    let new_id = match outcome {
        Err(e) if e.code == ErrorCode::NoRootSpots => {
            // Silent-fail path: the caller restores on its side.
            return Err(ApiError {
                status: StatusCode::CONFLICT,
                body: json!({
                    "error": ErrorCode::NoRootSpots.as_str(),
                    "message": "No available root spots",
                }),
            });
        }
        Err(e) if e.code == ErrorCode::UnknownType || e.code == ErrorCode::MissingType => {
            return Err(ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: json!({
                    "error": ErrorCode::UnsupportedEntity.as_str(),
                    "message": e.message,
                }),
            });
        }
        Err(e) => {
            log_api_transfer(&ctx, &entity_type, &old_id, None, &remote_source_id,
                &remote_source_name, &dest.world_id, &dest.name, false, Some(e.message.clone()));
            return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.message));
        }
        Ok(new_id) => new_id,
    };

    if entity_type == "fish" {
        dest.runner
            .with_backend(|backend| backend.record_energy_gain("migration_in", energy));
    }
    dest.runner.invalidate_cache();

    info!(
        "Remote transfer: added entity {} from {} to {} (was {})",
        new_id,
        remote_source_id,
        short(&dest.world_id),
        old_id
    );
    log_api_transfer(&ctx, &entity_type, &old_id, Some(new_id.clone()), &remote_source_id,
        &remote_source_name, &dest.world_id, &dest.name, true, None);

    let entity = TransferredEntity {
        old_id,
        new_id: Some(new_id),
        entity_type,
        source_server: Some(request.source_server_id),
        source_world: Some(request.source_world_id),
        destination_world: request.destination_world_id,
    };
    Ok(Json(json!({
        "success": true,
        "message": "Entity transferred successfully from remote server",
        "entity": entity,
    })))
}

#[allow(clippy::too_many_arguments)]
fn log_api_transfer(
    ctx: &AppContext,
    entity_type: &str,
    old_id: &str,
    new_id: Option<String>,
    source_world_id: &str,
    source_world_name: &str,
    dest_world_id: &str,
    dest_world_name: &str,
    success: bool,
    error: Option<String>,
) {
    ctx.history.log(TransferRecord {
        transfer_id: uuid::Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        entity_type: entity_type.to_string(),
        entity_old_id: old_id.to_string(),
        entity_new_id: new_id,
        source_world_id: source_world_id.to_string(),
        source_world_name: source_world_name.to_string(),
        dest_world_id: dest_world_id.to_string(),
        dest_world_name: dest_world_name.to_string(),
        success,
        error,
        generation: None,
        selection_seed: None,
    });
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConnectionsQuery {
    #[serde(default)]
    world_id: Option<WorldId>,
}

async fn list_connections(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ConnectionsQuery>,
) -> Json<Value> {
    let connections = match query.world_id.as_deref() {
        Some(world_id) => ctx.connections.for_world(world_id, None),
        None => ctx.connections.list(),
    };
    Json(json!({ "count": connections.len(), "connections": connections }))
}

async fn create_connection(
    State(ctx): State<Arc<AppContext>>,
    Json(payload): Json<Value>,
) -> ApiResult<Response> {
    let mut connection: Connection = serde_json::from_value(payload)
        .map_err(|e| ApiError::bad_request(format!("Invalid connection: {}", e)))?;
    connection.ensure_id();

    if connection.probability > 100 {
        return Err(ApiError::bad_request("Probability must be between 0 and 100"));
    }

    let local_server_id = &ctx.config.server_id;
    let is_local = |server_id: &Option<String>| {
        server_id.as_ref().map_or(true, |s| s == local_server_id)
    };
    if is_local(&connection.source_server_id)
        && ctx.manager.get(&connection.source_world_id).is_none()
    {
        return Err(ApiError::not_found(format!(
            "Source world not found: {}",
            connection.source_world_id
        )));
    }
    if is_local(&connection.dest_server_id)
        && ctx.manager.get(&connection.dest_world_id).is_none()
    {
        return Err(ApiError::not_found(format!(
            "Destination world not found: {}",
            connection.dest_world_id
        )));
    }

    let existed = ctx.connections.get(&connection.connection_id).is_some();
    ctx.connections.add(connection.clone());
    if !ctx.connections.save() {
        warn!("Failed to persist connections after update");
    }

    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(serde_json::to_value(connection).unwrap_or_default())).into_response())
}

async fn delete_connection(
    State(ctx): State<Arc<AppContext>>,
    Path(connection_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !ctx.connections.remove(&connection_id) {
        return Err(ApiError::not_found(format!(
            "Connection not found: {}",
            connection_id
        )));
    }
    if !ctx.connections.save() {
        warn!("Failed to persist connections after delete");
    }
    Ok(Json(json!({ "message": format!("Connection {} deleted", connection_id) })))
}

// ---------------------------------------------------------------------------
// Transfer history
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TransfersQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    world_id: Option<WorldId>,
    #[serde(default)]
    success_only: bool,
}

fn default_limit() -> usize {
    50
}

async fn list_transfers(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<TransfersQuery>,
) -> Json<Value> {
    let transfers = ctx
        .history
        .query(query.limit, query.world_id.as_deref(), query.success_only);
    Json(json!({ "count": transfers.len(), "transfers": transfers }))
}

async fn get_transfer(
    State(ctx): State<Arc<AppContext>>,
    Path(transfer_id): Path<String>,
) -> ApiResult<Json<TransferRecord>> {
    ctx.history
        .get(&transfer_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Transfer not found: {}", transfer_id)))
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

fn require_discovery_key(ctx: &AppContext, headers: &HeaderMap) -> ApiResult<()> {
    let provided = headers.get("X-Discovery-Key").and_then(|v| v.to_str().ok());
    if discovery_key_ok(ctx.config.discovery_api_key.as_deref(), provided) {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid discovery API key",
        ))
    }
}

fn require_valid_host(ctx: &AppContext, server_info: &ServerInfo) -> ApiResult<()> {
    validate_server_host(
        &server_info.host,
        ctx.config.allow_private_server_registration,
    )
    .map_err(ApiError::bad_request)
}

async fn discovery_register(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(server_info): Json<ServerInfo>,
) -> ApiResult<Json<Value>> {
    require_discovery_key(&ctx, &headers)?;
    require_valid_host(&ctx, &server_info)?;
    let server_id = server_info.server_id.clone();
    ctx.discovery.register(server_info);
    Ok(Json(json!({
        "status": "registered",
        "server_id": server_id,
        "message": format!("Server {} registered successfully", server_id),
    })))
}

async fn discovery_heartbeat(
    State(ctx): State<Arc<AppContext>>,
    Path(server_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ServerInfo>>,
) -> ApiResult<Json<Value>> {
    require_discovery_key(&ctx, &headers)?;
    let server_info = body.map(|Json(info)| info);
    if let Some(info) = &server_info {
        require_valid_host(&ctx, info)?;
    }
    if !ctx.discovery.heartbeat(&server_id, server_info) {
        return Err(ApiError::not_found(format!(
            "Server {} not registered. Please register first.",
            server_id
        )));
    }
    Ok(Json(json!({
        "status": "ok",
        "server_id": server_id,
        "message": "Heartbeat received",
    })))
}

#[derive(Debug, Deserialize)]
struct DiscoveryServersQuery {
    #[serde(default)]
    status: Option<ServerStatus>,
    #[serde(default = "default_true")]
    include_local: bool,
}

fn default_true() -> bool {
    true
}

async fn discovery_servers(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(query): Query<DiscoveryServersQuery>,
) -> ApiResult<Json<Value>> {
    require_discovery_key(&ctx, &headers)?;
    let servers = ctx.discovery.list(query.status, query.include_local);
    Ok(Json(json!({ "count": servers.len(), "servers": servers })))
}

async fn discovery_unregister(
    State(ctx): State<Arc<AppContext>>,
    Path(server_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_discovery_key(&ctx, &headers)?;
    if !ctx.discovery.unregister(&server_id) {
        return Err(ApiError::not_found(format!("Server not found: {}", server_id)));
    }
    Ok(Json(json!({
        "status": "unregistered",
        "server_id": server_id,
        "message": format!("Server {} unregistered successfully", server_id),
    })))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return forwarded.trim().to_string();
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.trim().to_string();
    }
    addr.ip().to_string()
}

async fn ws_default(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, &addr);
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, None, ip))
}

async fn ws_world(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
    Path(world_id): Path<WorldId>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, &addr);
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, Some(world_id), ip))
}

async fn close_with_policy_violation(mut socket: WebSocket, reason: &str) {
    let _ = socket
        .send(Message::Text(
            crate::protocol::ws_error_frame(reason).to_string(),
        ))
        .await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: WS_POLICY_VIOLATION,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_socket(
    mut socket: WebSocket,
    ctx: Arc<AppContext>,
    world_id: Option<WorldId>,
    ip: String,
) {
    let Some(instance) = ctx.manager.get_or_default(world_id.as_deref()) else {
        close_with_policy_violation(socket, "World not found.").await;
        return;
    };

    if !ctx.ws_limiter.connect(&ip) {
        close_with_policy_violation(socket, "Too many WebSocket connections from this IP.").await;
        return;
    }

    let Some((mut subscription, initial)) = ctx.hub.subscribe(&instance.world_id) else {
        ctx.ws_limiter.disconnect(&ip);
        close_with_policy_violation(socket, "World is not broadcasting.").await;
        return;
    };

    // New clients render immediately from one full-state frame.
    if socket.send(Message::Binary(initial.to_vec())).await.is_err() {
        ctx.hub
            .unsubscribe(&subscription.world_id, subscription.subscriber_id);
        ctx.ws_limiter.disconnect(&ip);
        return;
    }

    let mut policy_violation: Option<&'static str> = None;
    loop {
        tokio::select! {
            frame = subscription.receiver.recv() => {
                match frame {
                    Some(bytes) => {
                        if socket.send(Message::Binary(bytes.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            message = socket.recv() => {
                let Some(Ok(message)) = message else { break };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Binary(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            policy_violation = Some("Invalid message encoding.");
                            break;
                        }
                    },
                    Message::Close(_) => break,
                    _ => continue,
                };
                let command: ClientCommand = match serde_json::from_str(&text) {
                    Ok(command) => command,
                    Err(_) => {
                        policy_violation = Some("Invalid JSON payload.");
                        break;
                    }
                };
                if command.command.is_empty() {
                    continue;
                }
                let response = instance
                    .runner
                    .handle_command(&command.command, command.data.as_ref());
                let reply = match response {
                    Ok(Some(value)) => Some(value),
                    Ok(None) => None,
                    Err(e) => Some(crate::protocol::ws_error_frame(e.message)),
                };
                if let Some(reply) = reply {
                    if socket.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    ctx.hub
        .unsubscribe(&subscription.world_id, subscription.subscriber_id);
    ctx.ws_limiter.disconnect(&ip);

    if let Some(reason) = policy_violation {
        close_with_policy_violation(socket, reason).await;
    }
}
