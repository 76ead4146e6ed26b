//! Per-rule poll bookmarks. One row per automation; `last_seen_data` holds
//! event fingerprints plus small trigger-specific memory such as the last
//! OQL result count.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TriggerState {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub last_checked_at: DateTime<Utc>,
    pub last_seen_data: Value,
    /// Digest of the trigger declaration this bookmark was built against.
    pub checksum: Option<String>,
}

impl TriggerState {
    pub fn fresh(automation_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id,
            last_checked_at: Utc::now(),
            last_seen_data: Value::Object(Default::default()),
            checksum: None,
        }
    }

    /// Stamp the digest of the trigger declaration the bookmark tracks, so
    /// state left behind by an edited rule is identifiable.
    pub fn stamp_checksum(&mut self, digest: &str) {
        self.checksum = Some(digest.to_string());
    }

    pub fn has_seen(&self, fingerprint: &str) -> bool {
        self.last_seen_data
            .get(fingerprint)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }

    pub fn mark_seen(&mut self, fingerprint: &str) {
        if let Value::Object(map) = &mut self.last_seen_data {
            map.insert(fingerprint.to_string(), Value::Bool(true));
        }
    }

    /// Last observed OQL result count; negative means "never observed".
    pub fn oql_count(&self) -> i64 {
        self.last_seen_data
            .get("oqlCount")
            .and_then(Value::as_i64)
            .unwrap_or(-1)
    }

    pub fn set_oql_count(&mut self, count: i64) {
        if let Value::Object(map) = &mut self.last_seen_data {
            map.insert("oqlCount".to_string(), Value::from(count));
        }
    }

    /// Advance the bookmark; it never moves backwards.
    pub fn advance(&mut self, to: DateTime<Utc>) {
        if to > self.last_checked_at {
            self.last_checked_at = to;
        }
    }
}

#[derive(Clone)]
pub struct TriggerStateStore {
    pool: PgPool,
}

impl TriggerStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load the state for a rule, creating an empty one bookmarked at "now"
    /// on first use so installation does not replay history.
    pub async fn load_or_create(&self, automation_id: Uuid) -> Result<TriggerState, sqlx::Error> {
        let row: Option<(Uuid, Uuid, DateTime<Utc>, Value, Option<String>)> = sqlx::query_as(
            "SELECT id, automation_id, last_checked_at, last_seen_data, checksum \
             FROM trigger_states WHERE automation_id = $1",
        )
        .bind(automation_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id, automation_id, last_checked_at, last_seen_data, checksum)) = row {
            return Ok(TriggerState {
                id,
                automation_id,
                last_checked_at,
                last_seen_data,
                checksum,
            });
        }

        let state = TriggerState::fresh(automation_id);
        sqlx::query(
            r#"
            INSERT INTO trigger_states (id, automation_id, last_checked_at, last_seen_data, checksum, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (automation_id) DO NOTHING
            "#,
        )
        .bind(state.id)
        .bind(state.automation_id)
        .bind(state.last_checked_at)
        .bind(&state.last_seen_data)
        .bind(&state.checksum)
        .execute(&self.pool)
        .await?;
        Ok(state)
    }

    /// Persist the state. `GREATEST` keeps the bookmark monotonic even if a
    /// slow tick lands after a newer one.
    pub async fn save(&self, state: &TriggerState) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE trigger_states
            SET last_checked_at = GREATEST(last_checked_at, $2),
                last_seen_data = $3,
                checksum = $4,
                updated_at = NOW()
            WHERE automation_id = $1
            "#,
        )
        .bind(state.automation_id)
        .bind(state.last_checked_at)
        .bind(&state.last_seen_data)
        .bind(&state.checksum)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, automation_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM trigger_states WHERE automation_id = $1")
            .bind(automation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_memory() {
        let mut state = TriggerState::fresh(Uuid::new_v4());
        assert!(!state.has_seen("item.created:abc"));
        state.mark_seen("item.created:abc");
        assert!(state.has_seen("item.created:abc"));
    }

    #[test]
    fn test_checksum_stamping() {
        let mut state = TriggerState::fresh(Uuid::new_v4());
        assert!(state.checksum.is_none());
        state.stamp_checksum("deadbeefdeadbeef");
        assert_eq!(state.checksum.as_deref(), Some("deadbeefdeadbeef"));
    }

    #[test]
    fn test_oql_count_defaults_negative() {
        let mut state = TriggerState::fresh(Uuid::new_v4());
        assert_eq!(state.oql_count(), -1);
        state.set_oql_count(0);
        assert_eq!(state.oql_count(), 0);
        state.set_oql_count(7);
        assert_eq!(state.oql_count(), 7);
    }

    #[test]
    fn test_bookmark_never_moves_backwards() {
        let mut state = TriggerState::fresh(Uuid::new_v4());
        let original = state.last_checked_at;
        state.advance(original - chrono::Duration::seconds(60));
        assert_eq!(state.last_checked_at, original);
        let later = original + chrono::Duration::seconds(60);
        state.advance(later);
        assert_eq!(state.last_checked_at, later);
    }
}
