//! Inbound webhook routing: HMAC-authenticated POSTs that fire rules with a
//! `webhook.received` trigger.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::automation::rule::Trigger;
use crate::automation::TriggerEvent;
use crate::error::{ApiResult, AppError};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

pub fn webhook_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/inbound", post(inbound_default))
        .route("/inbound/:path", post(inbound))
        .route(
            "/subscriptions",
            axum::routing::get(list_subscriptions).post(create_subscription),
        )
        .route("/subscriptions/:id", axum::routing::delete(delete_subscription))
}

async fn inbound_default(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    handle_inbound(state, String::new(), headers, body).await
}

async fn inbound(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    handle_inbound(state, path, headers, body).await
}

async fn handle_inbound(
    state: Arc<AppState>,
    path: String,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Webhook-Signature".to_string()))?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {}", e)))?;

    // Fallback secrets for rules whose trigger does not carry its own.
    let subscription_secrets: Vec<String> = state
        .webhooks
        .list_active()
        .await?
        .into_iter()
        .map(|subscription| subscription.secret)
        .collect();

    let rules = state.rules.list_enabled().await?;
    let mut matched = false;
    let mut triggered = Vec::new();

    for rule in rules {
        let Trigger::WebhookReceived {
            path: rule_path,
            secret,
            filter,
        } = &rule.trigger
        else {
            continue;
        };
        if rule_path.as_deref().unwrap_or("") != path {
            continue;
        }
        matched = true;

        let authorized = match secret {
            Some(secret) => verify_signature(secret, &body, signature),
            None => subscription_secrets
                .iter()
                .any(|secret| verify_signature(secret, &body, signature)),
        };
        if !authorized {
            warn!("Webhook signature rejected for '{}'", rule.name);
            continue;
        }

        if let Some(filter) = filter {
            if !filter_matches(filter, &payload) {
                continue;
            }
        }

        info!("Webhook '{}' fired rule '{}'", path, rule.name);
        triggered.push(rule.id);

        let executor = state.executor.clone();
        let event = TriggerEvent::webhook(payload.clone());
        tokio::spawn(async move {
            if let Err(e) = executor.execute(&rule, event).await {
                warn!("Webhook-triggered execution failed: {}", e);
            }
        });
    }

    if !matched {
        return Err(AppError::NotFound("Webhook route".to_string()));
    }
    if triggered.is_empty() {
        return Err(AppError::Unauthorized(
            "Webhook signature verification failed".to_string(),
        ));
    }
    Ok(Json(json!({ "triggered": triggered })))
}

// =============================================================================
// Subscription administration
// =============================================================================

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionPayload {
    url: String,
    #[serde(default)]
    events: Vec<String>,
    secret: String,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    metadata: Option<Value>,
}

fn default_active() -> bool {
    true
}

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    _auth: crate::auth::AuthUser,
) -> ApiResult<Json<Vec<crate::store::WebhookSubscription>>> {
    Ok(Json(state.webhooks.list_active().await?))
}

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    _auth: crate::auth::AuthUser,
    Json(payload): Json<SubscriptionPayload>,
) -> ApiResult<Json<crate::store::WebhookSubscription>> {
    let subscription = crate::store::WebhookSubscription {
        id: uuid::Uuid::new_v4(),
        url: payload.url,
        events: payload.events,
        secret: payload.secret,
        active: payload.active,
        metadata: payload.metadata,
        created_at: chrono::Utc::now(),
        updated_at: None,
    };
    state.webhooks.insert(&subscription).await?;
    Ok(Json(subscription))
}

async fn delete_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<uuid::Uuid>,
    _auth: crate::auth::AuthUser,
) -> ApiResult<Json<Value>> {
    if !state.webhooks.delete(id).await? {
        return Err(AppError::NotFound("Webhook subscription".to_string()));
    }
    Ok(Json(json!({ "deleted": id })))
}

/// Every filter key must be present in the body with an equal value.
fn filter_matches(filter: &HashMap<String, Value>, payload: &Value) -> bool {
    filter
        .iter()
        .all(|(key, expected)| payload.get(key) == Some(expected))
}

/// Constant-time HMAC-SHA256 check over the raw body.
fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"event":"deploy"}"#;
        let signature = sign("s3cret", body);
        assert!(verify_signature("s3cret", body, &signature));
        assert!(verify_signature(
            "s3cret",
            body,
            &format!("sha256={}", signature)
        ));
        assert!(!verify_signature("wrong", body, &signature));
        assert!(!verify_signature("s3cret", b"tampered", &signature));
        assert!(!verify_signature("s3cret", body, "not-hex"));
    }

    #[test]
    fn test_filter_requires_every_pair() {
        let mut filter = HashMap::new();
        filter.insert("event".to_string(), json!("deploy"));
        filter.insert("env".to_string(), json!("prod"));

        assert!(filter_matches(
            &filter,
            &json!({ "event": "deploy", "env": "prod", "extra": 1 })
        ));
        assert!(!filter_matches(
            &filter,
            &json!({ "event": "deploy", "env": "staging" })
        ));
        assert!(!filter_matches(&filter, &json!({ "event": "deploy" })));
    }
}
