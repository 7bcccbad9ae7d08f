//! Inbound push deliveries: authenticate, dedupe, acknowledge, hand off.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::json;
use shared::models::{EventEnvelope, EventKind, MessageType, VerificationChallenge};
use tracing::{debug, info, instrument, warn};

use crate::{
    app_state::AppState,
    http::{ApiError, AppResult},
    services::{Job, dispatcher::DispatchError, signature},
};

pub const SIGNATURE_HEADERS: [&str; 2] = ["x-signature", "twitch-eventsub-message-signature"];
pub const MESSAGE_ID_HEADERS: [&str; 2] = ["x-message-id", "twitch-eventsub-message-id"];
pub const MESSAGE_TYPE_HEADERS: [&str; 2] = ["x-message-type", "twitch-eventsub-message-type"];
pub const TIMESTAMP_HEADERS: [&str; 2] = ["x-timestamp", "twitch-eventsub-message-timestamp"];

/// Bounded memory of accepted message ids, oldest evicted first.
#[derive(Debug)]
pub struct RecentMessageIds {
    capacity: usize,
    inner: Mutex<RecentInner>,
}

#[derive(Debug, Default)]
struct RecentInner {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentMessageIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(RecentInner::default()),
        }
    }

    /// Records `id`; false when it was already present.
    pub fn insert(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.seen.contains(id) {
            return false;
        }
        while inner.order.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(evicted) => {
                    inner.seen.remove(&evicted);
                }
                None => break,
            }
        }
        inner.seen.insert(id.to_string());
        inner.order.push_back(id.to_string());
        true
    }

    pub fn forget(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.seen.remove(id) {
            inner.order.retain(|existing| existing != id);
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

fn record(outcome: &'static str) {
    counter!("streamrelay_webhook_requests_total", "outcome" => outcome).increment(1);
}

fn reject(outcome: &'static str, err: ApiError) -> ApiError {
    record(outcome);
    err
}

fn acknowledged(outcome: &'static str) -> Response {
    record(outcome);
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

/// Webhook entry point.
///
/// Authentication and freshness are checked before the body is interpreted,
/// and nothing is mutated for a rejected request.
#[instrument(skip_all, fields(message_id = tracing::field::Empty))]
pub async fn receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let webhook = &state.config.webhook;
    let message_id = header(&headers, &MESSAGE_ID_HEADERS).unwrap_or_default();
    let timestamp = header(&headers, &TIMESTAMP_HEADERS).unwrap_or_default();
    tracing::Span::current().record("message_id", message_id);

    match webhook.secret.as_deref().filter(|secret| !secret.is_empty()) {
        Some(secret) => {
            let valid = header(&headers, &SIGNATURE_HEADERS).is_some_and(|provided| {
                signature::verify(secret, message_id, timestamp, &body, provided)
            });
            if !valid {
                warn!("rejected webhook with missing or invalid signature");
                return Err(reject(
                    "forbidden",
                    ApiError::new(
                        StatusCode::FORBIDDEN,
                        "invalid_signature",
                        "signature verification failed",
                    ),
                ));
            }
        }
        None => warn!("webhook secret not configured, accepting unsigned delivery"),
    }

    let sent_at = DateTime::parse_from_rfc3339(timestamp).map_err(|_| {
        reject(
            "bad_timestamp",
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "invalid_timestamp",
                "message timestamp is missing or malformed",
            ),
        )
    })?;
    let age = (Utc::now() - sent_at.with_timezone(&Utc)).abs();
    let max_age = chrono::Duration::from_std(webhook.max_message_age())
        .unwrap_or_else(|_| chrono::Duration::minutes(10));
    if age > max_age {
        warn!(age_secs = age.num_seconds(), "rejected stale webhook");
        return Err(reject(
            "stale",
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "stale_message",
                "message timestamp is outside the accepted window",
            ),
        ));
    }

    let message_type = header(&headers, &MESSAGE_TYPE_HEADERS)
        .and_then(MessageType::parse)
        .ok_or_else(|| {
            reject(
                "unknown_type",
                ApiError::bad_request("unknown or missing message type"),
            )
        })?;

    match message_type {
        MessageType::VerificationChallenge => challenge(&body),
        MessageType::Notification => notification(&state, message_id, &body),
        MessageType::Revocation => revocation(&state, &body).await,
    }
}

fn invalid_payload(err: &serde_json::Error) -> ApiError {
    reject(
        "invalid_payload",
        ApiError::bad_request(format!("invalid payload: {err}")),
    )
}

fn challenge(body: &[u8]) -> AppResult<Response> {
    let payload: VerificationChallenge =
        serde_json::from_slice(body).map_err(|err| invalid_payload(&err))?;
    info!("answered verification challenge");
    record("challenge");
    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        payload.challenge,
    )
        .into_response())
}

fn notification(state: &AppState, message_id: &str, body: &[u8]) -> AppResult<Response> {
    let envelope: EventEnvelope =
        serde_json::from_slice(body).map_err(|err| invalid_payload(&err))?;

    let Some(kind) = envelope.subscription.event_kind() else {
        info!(kind = %envelope.subscription.kind, "ignoring notification of unhandled kind");
        return Ok(acknowledged("ignored"));
    };
    let event = envelope.event.ok_or_else(|| {
        reject(
            "invalid_payload",
            ApiError::bad_request("notification without an event"),
        )
    })?;
    let job = match kind {
        EventKind::StreamOnline => Job::StreamOnline(
            serde_json::from_value(event).map_err(|err| invalid_payload(&err))?,
        ),
        EventKind::ClipDelete => Job::ClipDeleted(
            serde_json::from_value(event).map_err(|err| invalid_payload(&err))?,
        ),
    };

    if !message_id.is_empty() && !state.recent_messages.insert(message_id) {
        debug!("duplicate delivery acknowledged without processing");
        return Ok(acknowledged("duplicate"));
    }

    match state.dispatcher.try_dispatch(job) {
        Ok(()) => Ok(acknowledged("dispatched")),
        Err(err) => {
            // Let the platform's retry through.
            state.recent_messages.forget(message_id);
            warn!(error = %err, "could not queue notification");
            let outcome = match err {
                DispatchError::QueueFull => "queue_full",
                DispatchError::Closed => "closed",
            };
            Err(reject(
                outcome,
                ApiError::internal_server_error(err.to_string()),
            ))
        }
    }
}

async fn revocation(state: &AppState, body: &[u8]) -> AppResult<Response> {
    let envelope: EventEnvelope =
        serde_json::from_slice(body).map_err(|err| invalid_payload(&err))?;
    let subscription = &envelope.subscription;
    warn!(
        subscription_id = %subscription.id,
        kind = %subscription.kind,
        status = subscription.status.as_deref().unwrap_or("unknown"),
        "subscription revoked"
    );
    if let Err(err) = state.reconciler.revoke(subscription).await {
        warn!(error = %err, "failed to drop revoked subscription");
    }
    Ok(acknowledged("revocation"))
}
