#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures::{SinkExt, StreamExt};
use helpline_domain::{HelpRequest, Identity, RoomEvent, RoomId, StoredMessage, UserId};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::server::auth::verify_identity_token;
use crate::server::gateway::{ConnectError, Gateway, SendError};
use crate::server::health::{HealthState, healthz, readyz};
use crate::server::store::RequestStore;
use crate::server::workflow::{ResolutionWorkflow, ResolveError};
use crate::util::secret::SecretString;
use crate::util::time::unix_ms_now;

/// Shared router state.
#[derive(Clone)]
pub struct AppState {
	pub gateway: Arc<Gateway>,
	pub workflow: Arc<ResolutionWorkflow>,
	pub requests: Arc<dyn RequestStore>,
	pub health: HealthState,
	pub auth_hmac_secret: Option<SecretString>,
}

/// Build the HTTP/WebSocket front.
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.route("/rooms", post(create_room))
		.route("/rooms/{room_id}/messages", get(room_history))
		.route("/rooms/{room_id}/resolve", post(resolve_room))
		.route("/rooms/{room_id}/ws", get(room_ws))
		.with_state(state)
}

/// JSON error body with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
	status: StatusCode,
	code: &'static str,
	message: String,
}

impl ApiError {
	fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
		Self {
			status,
			code,
			message: message.into(),
		}
	}

	fn unauthorized(message: impl Into<String>) -> Self {
		Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
	}

	fn internal(message: impl Into<String>) -> Self {
		Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = Json(json!({ "code": self.code, "message": self.message }));
		(self.status, body).into_response()
	}
}

/// Identity parameters accepted alongside requests.
///
/// With an HMAC secret configured the signed `token` is required (query param
/// for WebSocket upgrades, `Authorization: Bearer` otherwise). Without a
/// secret the server is in dev mode and accepts plain `user_id`/`name`
/// parameters.
#[derive(Debug, Default, Deserialize)]
pub struct AuthParams {
	token: Option<String>,
	user_id: Option<String>,
	name: Option<String>,
}

fn bearer_token<'a>(headers: &'a HeaderMap, params: &'a AuthParams) -> Option<&'a str> {
	headers
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.or(params.token.as_deref())
}

fn caller_identity(secret: Option<&SecretString>, headers: &HeaderMap, params: &AuthParams) -> Result<Identity, ApiError> {
	match secret {
		Some(secret) => {
			let token = bearer_token(headers, params)
				.ok_or_else(|| ApiError::unauthorized("identity token required"))?;
			verify_identity_token(token, secret.expose()).map_err(|e| {
				debug!(error = %e, "identity token rejected");
				ApiError::unauthorized("invalid identity token")
			})
		}
		None => {
			let (Some(user_id), Some(name)) = (params.user_id.as_deref(), params.name.as_deref()) else {
				return Err(ApiError::unauthorized("user_id and name required (no auth secret configured)"));
			};
			let user_id = UserId::parse(user_id).map_err(|e| ApiError::unauthorized(format!("invalid user_id: {e}")))?;
			Identity::new(user_id, name).map_err(|_| ApiError::unauthorized("invalid display name"))
		}
	}
}

fn parse_room(room_id: &str) -> Result<RoomId, ApiError> {
	room_id
		.parse::<RoomId>()
		.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "invalid_room", format!("invalid room id: {e}")))
}

#[derive(Debug, Deserialize)]
struct CreateRoomBody {
	title: String,
	description: String,
}

async fn create_room(
	State(state): State<AppState>,
	Query(auth): Query<AuthParams>,
	headers: HeaderMap,
	Json(body): Json<CreateRoomBody>,
) -> Result<impl IntoResponse, ApiError> {
	let identity = caller_identity(state.auth_hmac_secret.as_ref(), &headers, &auth)?;
	if body.title.trim().is_empty() {
		return Err(ApiError::new(
			StatusCode::UNPROCESSABLE_ENTITY,
			"empty_title",
			"title must be non-empty",
		));
	}

	let id = RoomId::new(uuid::Uuid::new_v4().to_string())
		.map_err(|_| ApiError::internal("generated room id was empty"))?;
	let request = HelpRequest {
		id,
		owner: identity.user_id,
		title: body.title,
		description: body.description,
		created_at: unix_ms_now(),
	};

	state.requests.create(request.clone()).await.map_err(|e| {
		warn!(error = %e, "create help request failed");
		ApiError::internal("failed to create help request")
	})?;

	Ok((StatusCode::CREATED, Json(request)))
}

async fn room_history(
	State(state): State<AppState>,
	Path(room_id): Path<String>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
	let room = parse_room(&room_id)?;
	let messages = state.gateway.fetch_history(&room).await.map_err(|e| {
		warn!(room = %room, error = %e, "history fetch failed");
		ApiError::internal("failed to fetch history")
	})?;
	Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
	resolver_name: String,
}

async fn resolve_room(
	State(state): State<AppState>,
	Path(room_id): Path<String>,
	Query(auth): Query<AuthParams>,
	headers: HeaderMap,
	Json(body): Json<ResolveBody>,
) -> Result<impl IntoResponse, ApiError> {
	let identity = caller_identity(state.auth_hmac_secret.as_ref(), &headers, &auth)?;
	let room = parse_room(&room_id)?;

	match state.workflow.resolve_request(&identity, &room, &body.resolver_name).await {
		Ok(()) => Ok(Json(json!({ "resolved": true }))),
		Err(e) => {
			let (status, code) = resolve_error_status(&e);
			Err(ApiError::new(status, code, e.to_string()))
		}
	}
}

fn resolve_error_status(e: &ResolveError) -> (StatusCode, &'static str) {
	match e {
		ResolveError::MissingResolver => (StatusCode::UNPROCESSABLE_ENTITY, "missing_resolver"),
		ResolveError::RequestNotFound(_) => (StatusCode::NOT_FOUND, "request_not_found"),
		ResolveError::NotOwner => (StatusCode::FORBIDDEN, "not_owner"),
		ResolveError::ResolverNotFound(_) => (StatusCode::NOT_FOUND, "resolver_not_found"),
		ResolveError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
		ResolveError::PartialCompletion { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "partial_completion"),
	}
}

fn send_error_code(e: &SendError) -> &'static str {
	match e {
		SendError::EmptyBody => "empty_body",
		SendError::RoomNotFound(_) => "room_not_found",
		SendError::Store(_) => "store_error",
	}
}

async fn room_ws(
	State(state): State<AppState>,
	Path(room_id): Path<String>,
	Query(auth): Query<AuthParams>,
	headers: HeaderMap,
	ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
	let identity = caller_identity(state.auth_hmac_secret.as_ref(), &headers, &auth)?;
	let room = parse_room(&room_id)?;

	Ok(ws.on_upgrade(move |socket| handle_socket(state, room, identity, socket)))
}

/// Inbound frame on a room socket: a send-message request.
#[derive(Debug, Deserialize)]
struct ClientFrame {
	body: String,
}

fn error_frame(code: &str, message: &str) -> String {
	json!({ "type": "error", "code": code, "message": message }).to_string()
}

/// One task per socket: room events out as JSON, send-message frames in.
/// Dropping the `RoomConnection` on any exit runs the registry leave path.
async fn handle_socket(state: AppState, room: RoomId, identity: Identity, socket: WebSocket) {
	metrics::counter!("helpline_server_ws_connections_total").increment(1);

	let (mut ws_tx, mut ws_rx) = socket.split();

	let mut conn = match state.gateway.connect(room.clone(), &identity).await {
		Ok(conn) => conn,
		Err(e) => {
			let code = match e {
				ConnectError::RoomNotFound(_) => "room_not_found",
				ConnectError::Store(_) => "store_error",
			};
			let _ = ws_tx.send(Message::Text(error_frame(code, &e.to_string()).into())).await;
			let _ = ws_tx.close().await;
			return;
		}
	};

	debug!(room = %room, conn_id = conn.conn_id(), user = %identity.name, "ws: joined");

	loop {
		tokio::select! {
			event = conn.recv() => {
				let Some(event) = event else { break };
				let terminal = matches!(event, RoomEvent::Closed { .. });

				match serde_json::to_string(&event) {
					Ok(text) => {
						if ws_tx.send(Message::Text(text.into())).await.is_err() {
							break;
						}
					}
					Err(e) => {
						warn!(room = %room, error = %e, "ws: failed to encode room event");
						break;
					}
				}

				if terminal {
					break;
				}
			}

			frame = ws_rx.next() => {
				let Some(Ok(frame)) = frame else { break };

				match frame {
					Message::Text(text) => {
						if let Some(reply) = handle_client_frame(&state, &room, &identity, text.as_str()).await
							&& ws_tx.send(Message::Text(reply.into())).await.is_err()
						{
							break;
						}
					}
					Message::Close(_) => break,
					_ => {}
				}
			}
		}
	}

	let _ = ws_tx.close().await;
	debug!(room = %room, user = %identity.name, "ws: disconnected");
}

async fn handle_client_frame(state: &AppState, room: &RoomId, identity: &Identity, text: &str) -> Option<String> {
	let frame: ClientFrame = match serde_json::from_str(text) {
		Ok(frame) => frame,
		Err(_) => return Some(error_frame("invalid_frame", "expected {\"body\": \"...\"}")),
	};

	match state.gateway.send_message(room.clone(), identity, &frame.body).await {
		Ok(_) => None,
		Err(e) => Some(error_frame(send_error_code(&e), &e.to_string())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_errors_map_to_statuses() {
		let room = RoomId::new("42").unwrap();
		assert_eq!(
			resolve_error_status(&ResolveError::MissingResolver),
			(StatusCode::UNPROCESSABLE_ENTITY, "missing_resolver")
		);
		assert_eq!(
			resolve_error_status(&ResolveError::RequestNotFound(room)),
			(StatusCode::NOT_FOUND, "request_not_found")
		);
		assert_eq!(resolve_error_status(&ResolveError::NotOwner), (StatusCode::FORBIDDEN, "not_owner"));
		assert_eq!(
			resolve_error_status(&ResolveError::ResolverNotFound("Bob".to_string())),
			(StatusCode::NOT_FOUND, "resolver_not_found")
		);
		assert_eq!(
			resolve_error_status(&ResolveError::PartialCompletion {
				resolver: "Bob".to_string(),
				source: anyhow::anyhow!("boom"),
			})
			.1,
			"partial_completion"
		);
	}

	#[test]
	fn send_errors_have_stable_codes() {
		let room = RoomId::new("42").unwrap();
		assert_eq!(send_error_code(&SendError::EmptyBody), "empty_body");
		assert_eq!(send_error_code(&SendError::RoomNotFound(room)), "room_not_found");
		assert_eq!(send_error_code(&SendError::Store(anyhow::anyhow!("boom"))), "store_error");
	}

	#[test]
	fn error_frame_shape() {
		let frame = error_frame("empty_body", "empty message body");
		let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
		assert_eq!(v["type"], "error");
		assert_eq!(v["code"], "empty_body");
	}
}
