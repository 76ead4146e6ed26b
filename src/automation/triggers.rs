//! Trigger management: turns each enabled rule's trigger declaration into at
//! most one live watcher and feeds every firing into the executor.
//!
//! Polling triggers diff a remote list window against a per-rule bookmark;
//! fingerprints stored in `TriggerState.last_seen_data` suppress duplicate
//! firings across overlapping windows and restarts.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::onstaq::{HistoryEntry, Item, ListParams, OnstaqClient, OnstaqError};
use crate::store::{RuleStore, TriggerState, TriggerStateStore};

use super::context::TriggerEvent;
use super::executor::RuleExecutor;
use super::rule::{OqlTriggerPolicy, Rule, Trigger};

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Upstream error: {0}")]
    Upstream(#[from] OnstaqError),
    #[error("Scheduler error: {0}")]
    Cron(#[from] JobSchedulerError),
    #[error("Cron scheduler is not started")]
    SchedulerNotStarted,
    #[error("Invalid timezone '{0}'")]
    Timezone(String),
}

/// Short hex digest used to deduplicate observed events. The canonical
/// strings fed in here are part of the persisted format: changing them
/// invalidates every stored bookmark.
pub fn fingerprint(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..8])
}

enum Watcher {
    Poller(JoinHandle<()>),
    Cron(Uuid),
}

pub struct TriggerManager {
    client: Arc<OnstaqClient>,
    executor: Arc<RuleExecutor>,
    rules: RuleStore,
    states: TriggerStateStore,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    watchers: tokio::sync::Mutex<HashMap<Uuid, Watcher>>,
    scheduler: tokio::sync::Mutex<Option<JobScheduler>>,
}

impl TriggerManager {
    pub fn new(
        pool: sqlx::PgPool,
        client: Arc<OnstaqClient>,
        executor: Arc<RuleExecutor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            executor,
            rules: RuleStore::new(pool.clone()),
            states: TriggerStateStore::new(pool),
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            watchers: tokio::sync::Mutex::new(HashMap::new()),
            scheduler: tokio::sync::Mutex::new(None),
        }
    }

    /// Install watchers for every enabled rule.
    pub async fn start_all(&self, rules: &[Rule]) -> Result<(), TriggerError> {
        self.running.store(true, Ordering::SeqCst);

        {
            let mut scheduler = self.scheduler.lock().await;
            if scheduler.is_none() {
                let new_scheduler = JobScheduler::new().await?;
                new_scheduler.start().await?;
                *scheduler = Some(new_scheduler);
            }
        }

        for rule in rules.iter().filter(|rule| rule.enabled) {
            self.start_one(rule).await;
        }
        info!("Trigger manager started with {} rules", rules.len());
        Ok(())
    }

    /// Install the watcher for one rule, replacing any existing one. A
    /// disabled rule ends up with no watcher.
    pub async fn start_one(&self, rule: &Rule) {
        self.stop_one(rule.id).await;
        if !rule.enabled {
            return;
        }

        match &rule.trigger {
            Trigger::Schedule { cron, timezone } => {
                match self.install_cron(rule, cron, timezone.as_deref()).await {
                    Ok(job_id) => {
                        self.watchers
                            .lock()
                            .await
                            .insert(rule.id, Watcher::Cron(job_id));
                        info!("Installed schedule watcher for '{}'", rule.name);
                    }
                    Err(e) => {
                        // The rule stays without a watcher until reloaded.
                        error!("Failed to install schedule for '{}': {}", rule.name, e);
                    }
                }
            }
            Trigger::Manual {} | Trigger::WebhookReceived { .. } => {
                // Push-driven: no watcher to install.
            }
            _ => {
                let poller = Poller {
                    client: self.client.clone(),
                    executor: self.executor.clone(),
                    states: self.states.clone(),
                    running: self.running.clone(),
                    rule: rule.clone(),
                    interval: self.poll_interval,
                };
                let handle = tokio::spawn(async move { poller.run().await });
                self.watchers
                    .lock()
                    .await
                    .insert(rule.id, Watcher::Poller(handle));
                info!(
                    "Installed {} poller for '{}' (every {:?})",
                    rule.trigger.kind(),
                    rule.name,
                    self.poll_interval
                );
            }
        }
    }

    /// Remove a rule's watcher. Idempotent.
    pub async fn stop_one(&self, rule_id: Uuid) {
        let watcher = self.watchers.lock().await.remove(&rule_id);
        match watcher {
            Some(Watcher::Poller(handle)) => handle.abort(),
            Some(Watcher::Cron(job_id)) => {
                if let Some(scheduler) = self.scheduler.lock().await.as_ref() {
                    if let Err(e) = scheduler.remove(&job_id).await {
                        warn!("Failed to remove cron job {}: {}", job_id, e);
                    }
                }
            }
            None => {}
        }
    }

    /// Stop everything. Idempotent; pending tick callbacks observe the
    /// not-running flag and exit immediately.
    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);

        let watchers: Vec<Watcher> = {
            let mut map = self.watchers.lock().await;
            map.drain().map(|(_, watcher)| watcher).collect()
        };
        for watcher in watchers {
            if let Watcher::Poller(handle) = watcher {
                handle.abort();
            }
        }

        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            if let Err(e) = scheduler.shutdown().await {
                warn!("Cron scheduler shutdown failed: {}", e);
            }
        }
        info!("Trigger manager stopped");
    }

    /// Re-install a rule's watcher from its current persisted state.
    pub async fn reload(&self, rule_id: Uuid) -> Result<(), TriggerError> {
        self.stop_one(rule_id).await;
        if let Some(rule) = self.rules.get(rule_id).await? {
            self.start_one(&rule).await;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn install_cron(
        &self,
        rule: &Rule,
        cron: &str,
        timezone: Option<&str>,
    ) -> Result<Uuid, TriggerError> {
        let timezone = timezone.unwrap_or("UTC");
        let tz = chrono_tz::Tz::from_str(timezone)
            .map_err(|_| TriggerError::Timezone(timezone.to_string()))?;
        let expression = normalize_cron(cron);

        let executor = self.executor.clone();
        let running = self.running.clone();
        let rule = rule.clone();

        let job = Job::new_async_tz(expression.as_str(), tz, move |_job_id, _lock| {
            let executor = executor.clone();
            let running = running.clone();
            let rule = rule.clone();
            Box::pin(async move {
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                let event = TriggerEvent::scheduled(Utc::now());
                if let Err(e) = executor.execute(&rule, event).await {
                    error!("Scheduled run of '{}' failed: {}", rule.name, e);
                }
            })
        })?;

        let scheduler_guard = self.scheduler.lock().await;
        let scheduler = scheduler_guard
            .as_ref()
            .ok_or(TriggerError::SchedulerNotStarted)?;
        Ok(scheduler.add(job).await?)
    }
}

/// `tokio-cron-scheduler` expects six fields (with seconds); rules commonly
/// store the five-field form.
fn normalize_cron(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

// =============================================================================
// Polling
// =============================================================================

/// One rule's polling loop. Ticks are inherently serialized: the loop runs
/// the next tick only after the previous one finished.
struct Poller {
    client: Arc<OnstaqClient>,
    executor: Arc<RuleExecutor>,
    states: TriggerStateStore,
    running: Arc<AtomicBool>,
    rule: Rule,
    interval: Duration,
}

impl Poller {
    async fn run(self) {
        // First poll immediately after install.
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.tick().await {
                // Bookmark untouched: the next tick reprocesses this window.
                warn!("Poll tick for '{}' failed: {}", self.rule.name, e);
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn tick(&self) -> Result<(), TriggerError> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.states.load_or_create(self.rule.id).await?;
        state.stamp_checksum(&fingerprint(
            &serde_json::to_string(&self.rule.trigger).unwrap_or_default(),
        ));
        let now = Utc::now();

        let matches = self.poll(&mut state).await?;
        for (canonical, event) in matches {
            // A canonical string is absent for trigger kinds that carry
            // their own dedup (oql.match's count comparison).
            let print = canonical.as_deref().map(fingerprint);
            if let Some(print) = &print {
                if state.has_seen(print) {
                    continue;
                }
            }
            debug!(
                "'{}' trigger fired: {}",
                self.rule.name,
                canonical.as_deref().unwrap_or("oql.match")
            );
            if let Err(e) = self.executor.execute(&self.rule, event).await {
                warn!("Execution of '{}' failed: {}", self.rule.name, e);
            }
            if let Some(print) = &print {
                state.mark_seen(print);
                self.states.save(&state).await?;
            }
        }

        state.advance(now);
        self.states.save(&state).await?;
        Ok(())
    }

    /// Kind-specific poll: returns `(canonical event string, event)` pairs.
    /// `None` canonicals skip the fingerprint map entirely.
    async fn poll(
        &self,
        state: &mut TriggerState,
    ) -> Result<Vec<(Option<String>, TriggerEvent)>, TriggerError> {
        let matches = match self.rule.trigger.clone() {
            Trigger::ItemCreated { catalog_id } => self.poll_created(catalog_id, state).await?,
            Trigger::ItemUpdated { catalog_id } => self.poll_updated(catalog_id, state).await?,
            Trigger::ItemDeleted { catalog_id } => self.poll_deleted(catalog_id, state).await?,
            Trigger::AttributeChanged {
                catalog_id,
                attribute_name,
            } => {
                self.poll_attribute_changed(catalog_id, &attribute_name, state)
                    .await?
            }
            Trigger::StatusChanged {
                catalog_id,
                from,
                to,
            } => {
                self.poll_status_changed(catalog_id, from.as_deref(), to.as_deref(), state)
                    .await?
            }
            Trigger::ReferenceAdded {
                catalog_id,
                reference_kind,
            } => {
                self.poll_reference(
                    catalog_id,
                    "reference.added",
                    "REFERENCE_ADDED",
                    reference_kind.as_deref(),
                    state,
                )
                .await?
            }
            Trigger::ItemLinked {
                catalog_id,
                reference_kind,
            } => {
                self.poll_reference(
                    catalog_id,
                    "item.linked",
                    "REFERENCE_ADDED",
                    reference_kind.as_deref(),
                    state,
                )
                .await?
            }
            Trigger::ItemUnlinked {
                catalog_id,
                reference_kind,
            } => {
                self.poll_reference(
                    catalog_id,
                    "item.unlinked",
                    "REFERENCE_REMOVED",
                    reference_kind.as_deref(),
                    state,
                )
                .await?
            }
            Trigger::ItemCommented { catalog_id } => self.poll_commented(catalog_id, state).await?,
            Trigger::OqlMatch { query, trigger_on } => {
                // The count comparison is the dedup for this kind; no
                // fingerprints, or the seen map would grow on every firing.
                return Ok(self
                    .poll_oql(&query, trigger_on, state)
                    .await?
                    .into_iter()
                    .map(|event| (None, event))
                    .collect());
            }
            // Push- and cron-driven triggers never reach the poller.
            Trigger::Schedule { .. } | Trigger::Manual {} | Trigger::WebhookReceived { .. } => {
                Vec::new()
            }
        };
        Ok(matches
            .into_iter()
            .map(|(canonical, event)| (Some(canonical), event))
            .collect())
    }

    async fn window(
        &self,
        catalog_id: Uuid,
        sort_by: &str,
        extra_filters: &[(&str, &str)],
    ) -> Result<Vec<Item>, TriggerError> {
        let mut params = ListParams::poll_window(sort_by);
        params.filters = extra_filters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok(self.client.list_items(catalog_id, &params).await?.items)
    }

    async fn poll_created(
        &self,
        catalog_id: Uuid,
        state: &TriggerState,
    ) -> Result<Vec<(String, TriggerEvent)>, TriggerError> {
        let items = self.window(catalog_id, "createdAt", &[]).await?;
        Ok(items
            .into_iter()
            .filter(|item| item.created_at > state.last_checked_at)
            .map(|item| {
                let canonical = format!("item.created:{}", item.id);
                (canonical, TriggerEvent::for_item("item.created", item))
            })
            .collect())
    }

    async fn poll_updated(
        &self,
        catalog_id: Uuid,
        state: &TriggerState,
    ) -> Result<Vec<(String, TriggerEvent)>, TriggerError> {
        let items = self.window(catalog_id, "updatedAt", &[]).await?;
        let mut matches = Vec::new();
        for item in items {
            let Some(updated_at) = item.updated_at else { continue };
            if updated_at <= state.last_checked_at {
                continue;
            }
            let canonical = format!("item.updated:{}:{}", item.id, updated_at.to_rfc3339());
            let previous = self.previous_values(item.id).await;
            matches.push((
                canonical,
                TriggerEvent::for_item("item.updated", item).with_previous_values(previous),
            ));
        }
        Ok(matches)
    }

    async fn poll_deleted(
        &self,
        catalog_id: Uuid,
        state: &TriggerState,
    ) -> Result<Vec<(String, TriggerEvent)>, TriggerError> {
        let items = self
            .window(catalog_id, "updatedAt", &[("deleted", "true")])
            .await?;
        Ok(items
            .into_iter()
            .filter(|item| item.last_modified() > state.last_checked_at)
            .map(|item| {
                let canonical = format!("item.deleted:{}", item.id);
                (canonical, TriggerEvent::for_item("item.deleted", item))
            })
            .collect())
    }

    async fn poll_attribute_changed(
        &self,
        catalog_id: Uuid,
        attribute_name: &str,
        state: &TriggerState,
    ) -> Result<Vec<(String, TriggerEvent)>, TriggerError> {
        let items = self.window(catalog_id, "updatedAt", &[]).await?;
        let mut matches = Vec::new();
        for item in items {
            let history = self
                .client
                .list_history(item.id, Some(state.last_checked_at))
                .await?;
            for entry in history {
                if entry.action != "UPDATED" || !entry.changes.contains_key(attribute_name) {
                    continue;
                }
                let canonical = format!("attribute.changed:{}:{}", item.id, entry.id);
                let previous = changes_to_previous(&entry);
                matches.push((
                    canonical,
                    TriggerEvent::for_item("attribute.changed", item.clone())
                        .with_previous_values(previous),
                ));
            }
        }
        Ok(matches)
    }

    async fn poll_status_changed(
        &self,
        catalog_id: Option<Uuid>,
        from: Option<&str>,
        to: Option<&str>,
        state: &TriggerState,
    ) -> Result<Vec<(String, TriggerEvent)>, TriggerError> {
        // Status history keys: the distinguished "@status" field plus any
        // STATUS-typed attribute of the scanned catalogs.
        let catalogs: Vec<Uuid> = match catalog_id {
            Some(catalog_id) => vec![catalog_id],
            None => self
                .client
                .list_catalogs(self.rule.workspace_id)
                .await?
                .into_iter()
                .map(|catalog| catalog.id)
                .collect(),
        };

        let mut status_fields: HashSet<String> = HashSet::new();
        status_fields.insert("@status".to_string());
        for catalog in &catalogs {
            for attribute in self.client.list_attributes(*catalog).await? {
                if attribute.attribute_type.eq_ignore_ascii_case("STATUS") {
                    status_fields.insert(attribute.name);
                }
            }
        }

        let mut matches = Vec::new();
        for catalog in catalogs {
            let items = self.window(catalog, "updatedAt", &[]).await?;
            for item in items {
                let history = self
                    .client
                    .list_history(item.id, Some(state.last_checked_at))
                    .await?;
                for entry in history {
                    if entry.action != "UPDATED" {
                        continue;
                    }
                    let Some((field, change)) = entry
                        .changes
                        .iter()
                        .find(|(field, _)| status_fields.contains(*field))
                    else {
                        continue;
                    };

                    if !status_filter_matches(from, change.from.as_ref()) {
                        continue;
                    }
                    if !status_filter_matches(to, change.to.as_ref()) {
                        continue;
                    }

                    let canonical = format!("status.changed:{}:{}", item.id, entry.id);
                    let mut previous = HashMap::new();
                    previous.insert(
                        field.clone(),
                        change.from.clone().unwrap_or(Value::Null),
                    );
                    matches.push((
                        canonical,
                        TriggerEvent::for_item("status.changed", item.clone())
                            .with_previous_values(previous),
                    ));
                }
            }
        }
        Ok(matches)
    }

    async fn poll_reference(
        &self,
        catalog_id: Uuid,
        event_type: &str,
        history_action: &str,
        reference_kind: Option<&str>,
        state: &TriggerState,
    ) -> Result<Vec<(String, TriggerEvent)>, TriggerError> {
        let items = self.window(catalog_id, "updatedAt", &[]).await?;
        let mut matches = Vec::new();
        for item in items {
            let history = self
                .client
                .list_history(item.id, Some(state.last_checked_at))
                .await?;
            for entry in history {
                if entry.action != history_action {
                    continue;
                }
                if let Some(kind) = reference_kind {
                    let entry_kind = entry.reference_kind.as_deref().unwrap_or("");
                    if !entry_kind.eq_ignore_ascii_case(kind) {
                        continue;
                    }
                }
                let canonical = format!("{}:{}:{}", event_type, item.id, entry.id);
                matches.push((canonical, TriggerEvent::for_item(event_type, item.clone())));
            }
        }
        Ok(matches)
    }

    async fn poll_commented(
        &self,
        catalog_id: Uuid,
        state: &TriggerState,
    ) -> Result<Vec<(String, TriggerEvent)>, TriggerError> {
        let items = self.window(catalog_id, "updatedAt", &[]).await?;
        let mut matches = Vec::new();
        for item in items {
            let comments = self
                .client
                .list_comments(item.id, Some(state.last_checked_at))
                .await?;
            for comment in comments {
                if comment.created_at <= state.last_checked_at {
                    continue;
                }
                let canonical = format!("item.commented:{}:{}", item.id, comment.id);
                matches.push((
                    canonical,
                    TriggerEvent::for_item("item.commented", item.clone()),
                ));
            }
        }
        Ok(matches)
    }

    async fn poll_oql(
        &self,
        query: &str,
        policy: OqlTriggerPolicy,
        state: &mut TriggerState,
    ) -> Result<Vec<TriggerEvent>, TriggerError> {
        let result = self
            .client
            .execute_query(self.rule.workspace_id, query)
            .await?;
        let total = result.total_count;
        let previous = state.oql_count();

        // The first observation only primes the counter.
        let fire = match policy {
            OqlTriggerPolicy::AnyResults => total > 0,
            OqlTriggerPolicy::NewResults => previous >= 0 && total > previous,
            OqlTriggerPolicy::CountChange => previous >= 0 && total != previous,
        };
        state.set_oql_count(total);

        if fire {
            Ok(vec![TriggerEvent::oql_match(result)])
        } else {
            Ok(Vec::new())
        }
    }

    /// Previous attribute values for an update-style event: the most recent
    /// UPDATED history entry's `from` sides.
    async fn previous_values(&self, item_id: Uuid) -> HashMap<String, Value> {
        match self.client.list_history(item_id, None).await {
            Ok(history) => history
                .into_iter()
                .find(|entry| entry.action == "UPDATED")
                .map(|entry| changes_to_previous(&entry))
                .unwrap_or_default(),
            Err(e) => {
                debug!("Could not read history for {}: {}", item_id, e);
                HashMap::new()
            }
        }
    }
}

fn changes_to_previous(entry: &HistoryEntry) -> HashMap<String, Value> {
    entry
        .changes
        .iter()
        .map(|(field, change)| {
            (
                field.clone(),
                change.from.clone().unwrap_or(Value::Null),
            )
        })
        .collect()
}

fn status_filter_matches(filter: Option<&str>, observed: Option<&Value>) -> bool {
    let Some(filter) = filter else { return true };
    let observed = observed
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    observed.eq_ignore_ascii_case(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_short_stable_hex() {
        let print = fingerprint("item.created:abc");
        assert_eq!(print.len(), 16);
        assert!(print.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(print, fingerprint("item.created:abc"));
        assert_ne!(print, fingerprint("item.created:abd"));
    }

    #[test]
    fn test_normalize_cron_adds_seconds_field() {
        assert_eq!(normalize_cron("0 9 * * 1"), "0 0 9 * * 1");
        assert_eq!(normalize_cron("*/30 * * * * *"), "*/30 * * * * *");
    }

    #[test]
    fn test_status_filter_is_case_insensitive() {
        let open = Value::String("Open".to_string());
        assert!(status_filter_matches(Some("open"), Some(&open)));
        assert!(!status_filter_matches(Some("done"), Some(&open)));
        assert!(status_filter_matches(None, Some(&open)));
        assert!(!status_filter_matches(Some("open"), None));
    }

    #[test]
    fn test_oql_policy_first_observation_never_fires() {
        // previous < 0 means no prior observation.
        let previous: i64 = -1;
        let total: i64 = 5;
        assert!(!(previous >= 0 && total > previous));
        assert!(!(previous >= 0 && total != previous));
        // any_results fires regardless of history.
        assert!(total > 0);
    }
}
