//! Webhook subscription rows: the inbound router looks up signing secrets
//! here when a rule's trigger does not carry its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    pub events: Vec<String>,
    pub secret: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

type SubscriptionRow = (
    Uuid,
    String,
    Vec<String>,
    String,
    bool,
    Option<Value>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

#[derive(Clone)]
pub struct WebhookStore {
    pool: PgPool,
}

impl WebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_active(&self) -> Result<Vec<WebhookSubscription>, sqlx::Error> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            "SELECT id, url, events, secret, active, metadata, created_at, updated_at \
             FROM webhook_subscriptions WHERE active = true",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_subscription).collect())
    }

    pub async fn insert(&self, subscription: &WebhookSubscription) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions (id, url, events, secret, active, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.url)
        .bind(&subscription.events)
        .bind(&subscription.secret)
        .bind(subscription.active)
        .bind(&subscription.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_subscription(row: SubscriptionRow) -> WebhookSubscription {
    let (id, url, events, secret, active, metadata, created_at, updated_at) = row;
    WebhookSubscription {
        id,
        url,
        events,
        secret,
        active,
        metadata,
        created_at,
        updated_at,
    }
}
