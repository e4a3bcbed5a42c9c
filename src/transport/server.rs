//! HTTP/SSE transport
//!
//! A single endpoint (`/sbp`) accepts both POST (JSON-RPC request/response)
//! and GET (SSE subscription), per spec.md §4.7. The transport borrows
//! read/write access to the blackboard purely through its public
//! operations — it owns sessions and SSE subscribers itself.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use serde_json::json;
use tracing::{info, warn};
use warp::http::{HeaderMap, HeaderValue, StatusCode};
use warp::{Filter, Reply};

use crate::core::blackboard::{
    Blackboard, DeregisterStatus, EmitParams, EvaporateParams, InspectParams, RegisterScentParams, SniffParams,
};
use crate::core::config::Config;

use super::auth::AuthGate;
use super::jsonrpc::{codes, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use super::rate_limit::RateLimiter;
use super::session::SessionStore;
use super::sse::SseRegistry;

pub const PROTOCOL_VERSION: &str = "0.1";
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AppState {
    pub board: Arc<Blackboard>,
    pub sessions: Arc<SessionStore>,
    pub sse: Arc<SseRegistry>,
    pub auth: Arc<AuthGate>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub config: Arc<Config>,
    pub started_at: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wires each registered scent's handler slot to SSE fan-out. Called once
/// per scent registration so triggers reach every bound subscriber. A
/// present handler preempts HTTP dispatch for that scent (spec.md §4.4).
pub fn bind_scent_fanout(state: &Arc<AppState>, scent_id: &str) {
    let sse = state.sse.clone();
    let scent_id_owned = scent_id.to_string();
    state.board.on_trigger(
        scent_id,
        Arc::new(move |payload| {
            let sse = sse.clone();
            let scent_id = scent_id_owned.clone();
            Box::pin(async move {
                let notification = JsonRpcNotification::trigger(serde_json::to_value(&payload).unwrap_or(json!({})));
                sse.fan_out(&scent_id, serde_json::to_value(&notification).unwrap_or(json!({})));
            })
        }),
    );
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let state_filter = warp::any().map(move || state.clone());

    let health = warp::path("health")
        .and(warp::get())
        .and(state_filter.clone())
        .map(handle_health);

    let post_sbp = warp::path("sbp")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(state_filter.clone())
        .and_then(handle_post);

    let get_sbp = warp::path("sbp")
        .and(warp::get())
        .and(warp::header::headers_cloned())
        .and(state_filter.clone())
        .and_then(handle_sse);

    let rest_aliases = rest_alias_routes(state_filter.clone());

    health.or(post_sbp).or(get_sbp).or(rest_aliases)
}

fn handle_health(state: Arc<AppState>) -> impl Reply {
    let stats = state.board.inspect(InspectParams {
        trails: false,
        scents: false,
        stats: true,
        verbose: false,
    });
    warp::reply::json(&json!({
        "status": "ok",
        "version": CRATE_VERSION,
        "transport": "streamable-http-sse",
        "protocol_version": PROTOCOL_VERSION,
        "stats": stats.stats,
    }))
}

fn extract_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    extract_header(headers, "authorization").and_then(|v| v.strip_prefix("Bearer ").map(str::to_string))
}

fn rate_limit_key(headers: &HeaderMap) -> String {
    extract_header(headers, "sbp-agent-id")
        .map(str::to_string)
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Auth + rate-limit gate shared by the JSON-RPC endpoint and every REST
/// alias — both are callers of the same `dispatch`, so both must pass
/// through the same checks rather than the aliases bypassing them.
fn gate_check(state: &Arc<AppState>, headers: &HeaderMap) -> Option<warp::reply::Response> {
    if !state.auth.check(bearer_token(headers).as_deref()) {
        return Some(
            warp::reply::with_status(
                warp::reply::json(&JsonRpcResponse::error(
                    json!(null),
                    JsonRpcError::new(codes::UNAUTHORIZED, "unauthorized"),
                )),
                StatusCode::UNAUTHORIZED,
            )
            .into_response(),
        );
    }

    let decision = state.rate_limiter.check(&rate_limit_key(headers));
    if !decision.allowed {
        let mut response = warp::reply::with_status(
            warp::reply::json(&JsonRpcResponse::error(
                json!(null),
                JsonRpcError::with_data(
                    codes::RATE_LIMITED,
                    "rate limited",
                    json!({"retry_after_ms": decision.retry_after_ms}),
                ),
            )),
            StatusCode::TOO_MANY_REQUESTS,
        )
        .into_response();
        if let Ok(value) = HeaderValue::from_str(&(decision.retry_after_ms / 1000).max(1).to_string()) {
            response.headers_mut().insert("Retry-After", value);
        }
        return Some(response);
    }

    None
}

async fn handle_post(
    headers: HeaderMap,
    body: bytes::Bytes,
    state: Arc<AppState>,
) -> Result<Box<dyn Reply>, warp::Rejection> {
    if let Some(rejected) = gate_check(&state, &headers) {
        return Ok(Box::new(rejected));
    }

    let request: Result<JsonRpcRequest, _> = serde_json::from_slice(&body);
    let request = match request {
        Ok(r) => r,
        Err(_) => {
            return Ok(Box::new(warp::reply::with_status(
                warp::reply::json(&JsonRpcResponse::error(
                    json!(null),
                    JsonRpcError::new(codes::PARSE_ERROR, "failed to parse request body"),
                )),
                StatusCode::BAD_REQUEST,
            )));
        }
    };

    if let Err(msg) = request.validate() {
        return Ok(Box::new(warp::reply::json(&JsonRpcResponse::error(
            request.id.clone().unwrap_or(json!(null)),
            JsonRpcError::new(codes::INVALID_REQUEST, msg),
        ))));
    }

    let id = request.id.clone().unwrap_or(json!(null));
    let session_id = state.sessions.resolve(
        extract_header(&headers, "sbp-session-id"),
        extract_header(&headers, "sbp-agent-id"),
        now_ms(),
    );

    let response_body = dispatch(&state, &request.method, request.params, &session_id);
    let response = match response_body {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(err) => JsonRpcResponse::error(id, err),
    };

    let mut reply = warp::reply::json(&response).into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        reply.headers_mut().insert("Sbp-Session-Id", value);
    }
    Ok(Box::new(reply))
}

fn dispatch(
    state: &Arc<AppState>,
    method: &str,
    params: serde_json::Value,
    session_id: &str,
) -> Result<serde_json::Value, JsonRpcError> {
    match method {
        "sbp/emit" => {
            let params: EmitParams = parse_params(params)?;
            state
                .board
                .emit(params)
                .map(|r| serde_json::to_value(r).unwrap_or(json!({})))
                .map_err(from_core_error)
        }
        "sbp/sniff" => {
            let params: SniffParams = parse_params(params)?;
            Ok(serde_json::to_value(state.board.sniff(params)).unwrap_or(json!({})))
        }
        "sbp/register_scent" => {
            let params: RegisterScentParams = parse_params(params)?;
            let scent_id = params.scent_id.clone();
            let result = state.board.register_scent(params).map_err(from_core_error)?;
            bind_scent_fanout(state, &scent_id);
            Ok(serde_json::to_value(result).unwrap_or(json!({})))
        }
        "sbp/deregister_scent" => {
            let scent_id = params
                .get("scent_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| JsonRpcError::new(codes::INVALID_PARAMS, "scent_id is required"))?;
            let result = state.board.deregister_scent(scent_id);
            if result.status == DeregisterStatus::NotFound {
                return Err(JsonRpcError::new(codes::SCENT_NOT_FOUND, "scent not found"));
            }
            Ok(serde_json::to_value(result).unwrap_or(json!({})))
        }
        "sbp/evaporate" => {
            let params: EvaporateParams = parse_params(params)?;
            Ok(serde_json::to_value(state.board.evaporate(params)).unwrap_or(json!({})))
        }
        "sbp/inspect" => {
            let params: InspectParams = parse_params(params)?;
            Ok(serde_json::to_value(state.board.inspect(params)).unwrap_or(json!({})))
        }
        "sbp/subscribe" => {
            let scent_id = params
                .get("scent_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| JsonRpcError::new(codes::INVALID_PARAMS, "scent_id is required"))?;
            state.sse.bind_scent(session_id, scent_id);
            bind_scent_fanout(state, scent_id);
            Ok(json!({"scent_id": scent_id, "subscribed": true}))
        }
        "sbp/unsubscribe" => {
            let scent_id = params
                .get("scent_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| JsonRpcError::new(codes::INVALID_PARAMS, "scent_id is required"))?;
            state.sse.unbind_scent(session_id, scent_id);
            Ok(json!({"scent_id": scent_id, "subscribed": false}))
        }
        _ => Err(JsonRpcError::new(codes::METHOD_NOT_FOUND, format!("unknown method: {method}"))),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, JsonRpcError> {
    serde_json::from_value(value).map_err(|e| JsonRpcError::new(codes::INVALID_PARAMS, e.to_string()))
}

fn from_core_error(err: crate::core::error::BlackboardError) -> JsonRpcError {
    let code = err.rpc_code();
    JsonRpcError::new(code, err.to_string())
}

async fn handle_sse(headers: HeaderMap, state: Arc<AppState>) -> Result<Box<dyn Reply>, warp::Rejection> {
    let accept = extract_header(&headers, "accept").unwrap_or("");
    if !accept.contains("text/event-stream") {
        return Ok(Box::new(warp::reply::with_status(
            "Accept header must include text/event-stream",
            StatusCode::NOT_ACCEPTABLE,
        )));
    }

    if !state.auth.check(bearer_token(&headers).as_deref()) {
        return Ok(Box::new(warp::reply::with_status("unauthorized", StatusCode::UNAUTHORIZED)));
    }

    let session_id = state.sessions.resolve(
        extract_header(&headers, "sbp-session-id"),
        extract_header(&headers, "sbp-agent-id"),
        now_ms(),
    );
    let last_event_id = extract_header(&headers, "last-event-id").and_then(|v| v.parse::<u64>().ok());

    // An empty scent set still registers the subscriber under its session;
    // `sbp/subscribe` calls made afterward bind scents to it by session id,
    // and any scents already bound from a prior connection are picked back
    // up inside `subscribe` itself.
    let (client_id, rx) = state.sse.subscribe(&session_id, HashSet::new(), last_event_id);
    let guard = UnsubscribeGuard {
        sse: state.sse.clone(),
        client_id: client_id.clone(),
    };

    let keepalive_secs = state.config.transport.sse_keepalive_secs;
    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx).map(move |event| {
        let _guard = &guard;
        Ok::<_, warp::Error>(
            warp::sse::Event::default()
                .id(event.id.to_string())
                .event("message")
                .json_data(event.data)
                .unwrap_or_else(|_| warp::sse::Event::default()),
        )
    });

    let sse_reply = warp::sse::reply(warp::sse::keep_alive().interval(Duration::from_secs(keepalive_secs)).stream(stream));
    info!(session_id, client_id, "SSE subscriber connected");
    Ok(Box::new(sse_reply))
}

/// Holds a subscriber's registration alive for as long as its stream is
/// polled. The stream's `Map` closure owns this, so dropping the stream
/// (client disconnect, including `warp`'s keep-alive ping failing) drops
/// the guard and removes the subscriber entry — there is no other hook
/// `warp::sse::reply` exposes for connection teardown.
struct UnsubscribeGuard {
    sse: Arc<SseRegistry>,
    client_id: String,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        self.sse.unsubscribe(&self.client_id);
    }
}

/// Convenience REST aliases (spec.md §4.7): `POST /emit`, `POST /sniff`,
/// etc., mapping to the same core operations with identical semantics.
/// The request body IS the method's params (no JSON-RPC envelope).
fn rest_alias_routes(
    state_filter: impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone + Send + Sync + 'static,
) -> impl Filter<Extract = (impl Reply,), Error = std::convert::Infallible> + Clone {
    let emit = warp::path("emit")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|headers: HeaderMap, params: serde_json::Value, state: Arc<AppState>| {
            rest_alias_reply(&state, &headers, "sbp/emit", params)
        });

    let sniff = warp::path("sniff")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|headers: HeaderMap, params: serde_json::Value, state: Arc<AppState>| {
            rest_alias_reply(&state, &headers, "sbp/sniff", params)
        });

    let register_scent = warp::path("register_scent")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|headers: HeaderMap, params: serde_json::Value, state: Arc<AppState>| {
            rest_alias_reply(&state, &headers, "sbp/register_scent", params)
        });

    let deregister_scent = warp::path("deregister_scent")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|headers: HeaderMap, params: serde_json::Value, state: Arc<AppState>| {
            rest_alias_reply(&state, &headers, "sbp/deregister_scent", params)
        });

    let evaporate = warp::path("evaporate")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|headers: HeaderMap, params: serde_json::Value, state: Arc<AppState>| {
            rest_alias_reply(&state, &headers, "sbp/evaporate", params)
        });

    let inspect = warp::path("inspect")
        .and(warp::post())
        .and(warp::header::headers_cloned())
        .and(warp::body::json())
        .and(state_filter)
        .map(|headers: HeaderMap, params: serde_json::Value, state: Arc<AppState>| {
            rest_alias_reply(&state, &headers, "sbp/inspect", params)
        });

    emit.or(sniff).or(register_scent).or(deregister_scent).or(evaporate).or(inspect)
}

fn rest_alias_reply(state: &Arc<AppState>, headers: &HeaderMap, method: &str, params: serde_json::Value) -> warp::reply::Response {
    if let Some(rejected) = gate_check(state, headers) {
        return rejected;
    }

    let session_id = state.sessions.resolve(
        extract_header(headers, "sbp-session-id"),
        extract_header(headers, "sbp-agent-id"),
        now_ms(),
    );
    match dispatch(state, method, params, &session_id) {
        Ok(result) => warp::reply::with_status(warp::reply::json(&result), StatusCode::OK).into_response(),
        Err(err) => {
            warn!(method, code = err.code, "rest alias dispatch error");
            warp::reply::with_status(warp::reply::json(&err), StatusCode::BAD_REQUEST).into_response()
        }
    }
}
