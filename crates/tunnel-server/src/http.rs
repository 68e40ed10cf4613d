//! HTTP push/poll handlers (spec §6 "External interfaces"). Routes are
//! deliberately thin: decode the envelope, resolve a processor from the
//! registry, delegate to it, re-encode the reply.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use uuid::Uuid;

use tunnel_wire::packet::packet_to_envelope;
use tunnel_wire::{envelope, EnvelopeMeta, TunnelPackage, TunnelType};

use crate::error::Error as ServerError;
use crate::processor::{PollOutcome, ServerStreamProcessor};
use crate::registry::ConnectionRegistry;

pub const TUNNEL_PACKAGE_HEADER: &str = "X-Tunnel-Package";

pub fn router(registry: ConnectionRegistry) -> Router {
    Router::new()
        .route("/push", post(push_handler))
        .route("/poll", get(poll_handler))
        .with_state(registry)
}

pub async fn health_status(registry: &ConnectionRegistry) -> serde_json::Value {
    serde_json::json!({ "status": "ok", "active_connections": registry.len().await })
}

fn decode_envelope(headers: &HeaderMap) -> Result<TunnelPackage, Response> {
    let header_val = headers
        .get(TUNNEL_PACKAGE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "missing X-Tunnel-Package header").into_response())?;
    envelope::decode(header_val).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())
}

fn encode_response_header(reply: &TunnelPackage) -> Response {
    match envelope::encode(reply) {
        Ok(encoded) => {
            let mut response = StatusCode::OK.into_response();
            if let Ok(value) = HeaderValue::from_str(&encoded) {
                response.headers_mut().insert(TUNNEL_PACKAGE_HEADER, value);
            }
            response
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn new_connection_id() -> String {
    format!("conn_{}", Uuid::new_v4().simple())
}

async fn resolve_or_create_processor(
    registry: &ConnectionRegistry,
    envelope: &TunnelPackage,
) -> Result<Arc<ServerStreamProcessor>, Response> {
    match envelope.connection_id.as_deref() {
        Some(id) if !id.is_empty() => registry
            .get(id)
            .await
            .ok_or_else(|| (StatusCode::NOT_FOUND, "unknown connection").into_response()),
        _ => {
            let processor = Arc::new(ServerStreamProcessor::new(new_connection_id()));
            registry.register(processor.clone()).await;
            processor.clone().spawn_scheduler();
            Ok(processor)
        }
    }
}

async fn push_handler(
    State(registry): State<ConnectionRegistry>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let envelope = match decode_envelope(&headers) {
        Ok(e) => e,
        Err(resp) => return resp,
    };
    let processor = match resolve_or_create_processor(&registry, &envelope).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let fragment_body = if body.is_empty() { None } else { Some(body.as_str()) };
    match processor.handle_push(&envelope, fragment_body).await {
        Ok(Some(reply_packet)) => {
            let reply_envelope = packet_to_envelope(
                &reply_packet,
                EnvelopeMeta {
                    connection_id: Some(processor.connection_id().to_owned()),
                    request_id: envelope.request_id.clone(),
                    client_id: Some(processor.client_id()),
                    mapping_id: processor.mapping_id().await,
                    tunnel_type: Some(TunnelType::Control),
                },
            );
            encode_response_header(&reply_envelope)
        }
        Ok(None) => StatusCode::OK.into_response(),
        Err(ServerError::Closed) => StatusCode::GONE.into_response(),
        Err(ServerError::BadEnvelope(msg)) | Err(ServerError::UnknownPacketType(msg)) => {
            (StatusCode::BAD_REQUEST, msg).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn poll_handler(State(registry): State<ConnectionRegistry>, headers: HeaderMap) -> Response {
    let envelope = match decode_envelope(&headers) {
        Ok(e) => e,
        Err(resp) => return resp,
    };
    let connection_id = match envelope.connection_id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => return (StatusCode::BAD_REQUEST, "poll requires a connection id").into_response(),
    };
    let processor = match registry.get(connection_id).await {
        Some(p) => p,
        None => return (StatusCode::NOT_FOUND, "unknown connection").into_response(),
    };

    let request_id = envelope.request_id.clone().unwrap_or_default();
    let tunnel_type = envelope.tunnel_type.unwrap_or(TunnelType::Control);

    match processor.handle_poll(&request_id, tunnel_type).await {
        Ok(PollOutcome::Control(reply_envelope)) => encode_response_header(&reply_envelope),
        Ok(PollOutcome::Fragment(fragment_json)) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            format!(r#"{{"success":true,"data":{fragment_json},"timeout":false}}"#),
        )
            .into_response(),
        Ok(PollOutcome::Timeout) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            r#"{"success":false,"timeout":true}"#.to_string(),
        )
            .into_response(),
        Err(ServerError::Closed) => StatusCode::GONE.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
