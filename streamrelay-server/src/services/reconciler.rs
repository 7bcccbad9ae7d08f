//! Keeps the local subscription ledger and the remote registry in agreement.
//!
//! Every read-modify-write step for an entity runs under that entity's lock,
//! so the sweep and direct follow/unfollow calls never interleave on the same
//! entity. Sweeps themselves never overlap.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use shared::{
    config::server::ReconciliationConfig,
    models::{
        EventKind, FollowKind, RemoteSubscription, SubscriptionDescriptor, SubscriptionStatus,
        SweepReport,
    },
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::keyed_lock::KeyedLocks;
use crate::{
    db::store::{Store, StoreError},
    platform::{PlatformApi, PlatformError},
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("platform call failed: {0}")]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("timed out")]
    TimedOut,
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// A live local record was already present.
    Existing,
    Created,
    /// The platform reported a conflict and a matching remote subscription
    /// was taken over.
    Adopted,
    /// Conflict without a matching remote subscription; left as-is.
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitySync {
    Subscribed(SubscribeOutcome),
    Unsubscribed { removed: bool },
}

type Key = (String, EventKind);

/// Everything the sweep learned about one (entity, kind) before taking its lock.
struct SweepEntry {
    entity_id: String,
    kind: EventKind,
    entity_name: String,
    listed: Vec<SubscriptionDescriptor>,
    snapshot: Option<RemoteSubscription>,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    platform: Arc<dyn PlatformApi>,
    locks: KeyedLocks,
    sweep_lock: Mutex<()>,
    callback_url: String,
    config: ReconciliationConfig,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("callback_url", &self.callback_url)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn local_record(
    subscription_id: &str,
    entity_id: &str,
    entity_name: &str,
    kind: EventKind,
    status: SubscriptionStatus,
) -> RemoteSubscription {
    RemoteSubscription {
        subscription_id: subscription_id.to_string(),
        entity_name: entity_name.to_string(),
        entity_id: entity_id.to_string(),
        event_kind: kind,
        status,
        updated_at: Utc::now(),
    }
}

fn count_action(action: &'static str, amount: u32) {
    if amount > 0 {
        metrics::counter!("streamrelay_sweep_actions_total", "action" => action)
            .increment(u64::from(amount));
    }
}

fn absorb(total: &mut SweepReport, delta: &SweepReport) {
    total.adopted += delta.adopted;
    total.created += delta.created;
    total.orphans_deleted += delta.orphans_deleted;
    total.duplicates_deleted += delta.duplicates_deleted;
    total.stale_removed += delta.stale_removed;
    total.unsubscribed += delta.unsubscribed;
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        platform: Arc<dyn PlatformApi>,
        callback_url: impl Into<String>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            platform,
            locks: KeyedLocks::new(),
            sweep_lock: Mutex::new(()),
            callback_url: callback_url.into(),
            config,
        }
    }

    fn owns(&self, descriptor: &SubscriptionDescriptor) -> bool {
        descriptor.callback() == Some(self.callback_url.as_str())
    }

    /// Idempotent: returns early when a live local record exists.
    #[instrument(skip(self))]
    pub async fn ensure_subscribed(
        &self,
        entity_id: &str,
        entity_name: &str,
        kind: EventKind,
    ) -> ReconcileResult<SubscribeOutcome> {
        let _guard = self.locks.lock(entity_id).await;
        self.subscribe_locked(entity_id, entity_name, kind, self.config.subscribe_attempts)
            .await
    }

    /// Removes the remote and local subscription. A remote "not found" counts
    /// as already deleted. The local record is dropped even when the remote
    /// delete fails; the next sweep cleans up the remote orphan.
    #[instrument(skip(self))]
    pub async fn ensure_unsubscribed(
        &self,
        entity_id: &str,
        entity_name: &str,
        kind: EventKind,
    ) -> ReconcileResult<bool> {
        let _guard = self.locks.lock(entity_id).await;
        self.unsubscribe_locked(entity_id, kind).await
    }

    /// Platform-initiated revocation: forget the local record, never re-create.
    #[instrument(skip(self, descriptor), fields(subscription_id = %descriptor.id))]
    pub async fn revoke(&self, descriptor: &SubscriptionDescriptor) -> ReconcileResult<bool> {
        let key = descriptor.entity_id().unwrap_or(descriptor.id.as_str());
        let _guard = self.locks.lock(key).await;
        let removed = self.store.remove_subscription(&descriptor.id).await?;
        if removed {
            info!(kind = %descriptor.kind, "subscription revoked by platform");
            count_action("revoked", 1);
        } else {
            debug!("revocation for unknown subscription");
        }
        Ok(removed)
    }

    /// Brings one entity's subscription in line with its current follow count.
    /// Used on the follow/unfollow path, so transient failures are retried.
    #[instrument(skip(self))]
    pub async fn reconcile_entity(
        &self,
        entity_id: &str,
        entity_name: &str,
        kind: FollowKind,
    ) -> ReconcileResult<EntitySync> {
        let _guard = self.locks.lock(entity_id).await;
        let event_kind = kind.required_event_kind();
        if self.store.count_follows(entity_id, kind).await? > 0 {
            self.subscribe_locked(
                entity_id,
                entity_name,
                event_kind,
                self.config.subscribe_attempts,
            )
            .await
            .map(EntitySync::Subscribed)
        } else {
            self.unsubscribe_locked(entity_id, event_kind)
                .await
                .map(|removed| EntitySync::Unsubscribed { removed })
        }
    }

    async fn subscribe_locked(
        &self,
        entity_id: &str,
        entity_name: &str,
        kind: EventKind,
        attempts: u32,
    ) -> ReconcileResult<SubscribeOutcome> {
        if let Some(existing) = self.store.get_subscription_by_entity(entity_id, kind).await?
            && existing.status.is_live()
        {
            return Ok(SubscribeOutcome::Existing);
        }

        match self.create_with_retry(kind, entity_id, attempts).await {
            Ok(created) => {
                self.store
                    .upsert_subscription(&local_record(
                        &created.id,
                        entity_id,
                        entity_name,
                        kind,
                        SubscriptionStatus::Enabled,
                    ))
                    .await?;
                info!(subscription_id = %created.id, "subscription created");
                Ok(SubscribeOutcome::Created)
            }
            Err(PlatformError::Conflict) => self.adopt_remote(entity_id, entity_name, kind).await,
            Err(err) => Err(err.into()),
        }
    }

    async fn create_with_retry(
        &self,
        kind: EventKind,
        entity_id: &str,
        attempts: u32,
    ) -> Result<SubscriptionDescriptor, PlatformError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.platform.create_subscription(kind, entity_id).await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(attempt, error = %err, "subscription create failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.subscribe_backoff()).await;
                }
                result => return result,
            }
        }
    }

    async fn adopt_remote(
        &self,
        entity_id: &str,
        entity_name: &str,
        kind: EventKind,
    ) -> ReconcileResult<SubscribeOutcome> {
        let listed = self.platform.list_subscriptions().await?;
        let found = listed.into_iter().find(|sub| {
            self.owns(sub)
                && sub.event_kind() == Some(kind)
                && sub.entity_id() == Some(entity_id)
                && sub.status() == SubscriptionStatus::Enabled
        });

        let Some(found) = found else {
            warn!("platform reported a conflict but no matching subscription is listed");
            return Ok(SubscribeOutcome::Unresolved);
        };

        self.store
            .upsert_subscription(&local_record(
                &found.id,
                entity_id,
                entity_name,
                kind,
                SubscriptionStatus::Enabled,
            ))
            .await?;
        info!(subscription_id = %found.id, "adopted existing remote subscription");
        Ok(SubscribeOutcome::Adopted)
    }

    async fn unsubscribe_locked(&self, entity_id: &str, kind: EventKind) -> ReconcileResult<bool> {
        let Some(local) = self.store.get_subscription_by_entity(entity_id, kind).await? else {
            return Ok(false);
        };

        let remote = self.delete_remote(&local.subscription_id).await;
        self.store.remove_subscription(&local.subscription_id).await?;
        match remote {
            Ok(()) => {
                info!(subscription_id = %local.subscription_id, "subscription removed");
                Ok(true)
            }
            Err(err) => {
                warn!(
                    subscription_id = %local.subscription_id,
                    error = %err,
                    "remote delete failed, local record dropped anyway"
                );
                Err(err)
            }
        }
    }

    async fn delete_remote(&self, subscription_id: &str) -> ReconcileResult<()> {
        match self.platform.delete_subscription(subscription_id).await {
            Ok(()) | Err(PlatformError::NotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Full three-way comparison of remote, local and required subscriptions.
    ///
    /// Fails only when the inputs cannot be read; per-entity failures and
    /// timeouts are counted in `failed_entities` and left for the next sweep.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> ReconcileResult<SweepReport> {
        let _sweep = self.sweep_lock.lock().await;
        let mut report = SweepReport::default();

        let snapshot: HashMap<Key, RemoteSubscription> = self
            .store
            .list_subscriptions()
            .await?
            .into_iter()
            .map(|sub| ((sub.entity_id.clone(), sub.event_kind), sub))
            .collect();
        let required: HashMap<Key, String> = self
            .store
            .required_subscriptions()
            .await?
            .into_iter()
            .map(|req| ((req.entity_id, req.event_kind), req.entity_name))
            .collect();
        let listed = self.platform.list_subscriptions().await?;

        let mut grouped: HashMap<Key, Vec<SubscriptionDescriptor>> = HashMap::new();
        for sub in listed.into_iter().filter(|sub| self.owns(sub)) {
            match (sub.event_kind(), sub.entity_id()) {
                (Some(kind), Some(entity_id)) => grouped
                    .entry((entity_id.to_string(), kind))
                    .or_default()
                    .push(sub),
                _ => match self.delete_remote(&sub.id).await {
                    Ok(()) => report.orphans_deleted += 1,
                    Err(err) => {
                        warn!(subscription_id = %sub.id, kind = %sub.kind, error = %err, "failed to delete unrecognised subscription");
                    }
                },
            }
        }

        let keys: BTreeSet<Key> = snapshot
            .keys()
            .chain(required.keys())
            .chain(grouped.keys())
            .cloned()
            .collect();

        for key in keys {
            let snapshot_row = snapshot.get(&key).cloned();
            let entity_name = required
                .get(&key)
                .cloned()
                .or_else(|| snapshot_row.as_ref().map(|row| row.entity_name.clone()))
                .unwrap_or_else(|| key.0.clone());
            let entry = SweepEntry {
                listed: grouped.remove(&key).unwrap_or_default(),
                snapshot: snapshot_row,
                entity_name,
                entity_id: key.0,
                kind: key.1,
            };
            let entity_id = entry.entity_id.clone();
            let kind = entry.kind;

            let outcome = tokio::time::timeout(self.config.entity_timeout(), self.sweep_entity(entry))
                .await
                .unwrap_or(Err(ReconcileError::TimedOut));
            match outcome {
                Ok(delta) => absorb(&mut report, &delta),
                Err(err) => {
                    report.failed_entities += 1;
                    error!(entity_id = %entity_id, %kind, error = %err, "sweep skipped entity");
                }
            }
        }

        count_action("adopted", report.adopted);
        count_action("created", report.created);
        count_action("orphan_deleted", report.orphans_deleted);
        count_action("duplicate_deleted", report.duplicates_deleted);
        count_action("stale_removed", report.stale_removed);
        count_action("unsubscribed", report.unsubscribed);
        count_action("failed", report.failed_entities);
        info!(
            changes = report.changes(),
            failed = report.failed_entities,
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    async fn sweep_entity(&self, entry: SweepEntry) -> ReconcileResult<SweepReport> {
        let SweepEntry {
            entity_id,
            kind,
            entity_name,
            listed,
            snapshot,
        } = entry;
        let _guard = self.locks.lock(&entity_id).await;
        let mut delta = SweepReport::default();

        let (mut live, dead): (Vec<_>, Vec<_>) =
            listed.into_iter().partition(|sub| sub.status().is_live());
        for sub in dead {
            self.delete_remote(&sub.id).await?;
            delta.orphans_deleted += 1;
        }

        let local = match self.store.get_subscription_by_entity(&entity_id, kind).await? {
            Some(row) => {
                if let Some(remote) = live.iter().find(|sub| sub.id == row.subscription_id) {
                    let status = remote.status();
                    if row.status != status {
                        self.store
                            .upsert_subscription(&RemoteSubscription {
                                status,
                                updated_at: Utc::now(),
                                ..row.clone()
                            })
                            .await?;
                    }
                    Some(row)
                } else if snapshot
                    .as_ref()
                    .is_some_and(|snap| snap.subscription_id == row.subscription_id)
                {
                    self.store.remove_subscription(&row.subscription_id).await?;
                    delta.stale_removed += 1;
                    None
                } else {
                    // Written after the remote listing was taken.
                    Some(row)
                }
            }
            None => None,
        };

        let required = self.store.count_follows(&entity_id, kind.follow_kind()).await? > 0;

        match (local, required) {
            (Some(row), true) => {
                for sub in live.iter().filter(|sub| sub.id != row.subscription_id) {
                    self.delete_remote(&sub.id).await?;
                    delta.duplicates_deleted += 1;
                }
            }
            (Some(row), false) => {
                for sub in live.iter().filter(|sub| sub.id != row.subscription_id) {
                    self.delete_remote(&sub.id).await?;
                    delta.orphans_deleted += 1;
                }
                self.delete_remote(&row.subscription_id).await?;
                self.store.remove_subscription(&row.subscription_id).await?;
                delta.unsubscribed += 1;
            }
            (None, true) => {
                live.sort_by_key(|sub| sub.status() != SubscriptionStatus::Enabled);
                let mut candidates = live.into_iter();
                if let Some(keep) = candidates.next() {
                    self.store
                        .upsert_subscription(&local_record(
                            &keep.id,
                            &entity_id,
                            &entity_name,
                            kind,
                            keep.status(),
                        ))
                        .await?;
                    delta.adopted += 1;
                    for sub in candidates {
                        self.delete_remote(&sub.id).await?;
                        delta.duplicates_deleted += 1;
                    }
                } else {
                    match self.subscribe_locked(&entity_id, &entity_name, kind, 1).await? {
                        SubscribeOutcome::Created => delta.created += 1,
                        SubscribeOutcome::Adopted => delta.adopted += 1,
                        SubscribeOutcome::Existing | SubscribeOutcome::Unresolved => {}
                    }
                }
            }
            (None, false) => {
                for sub in &live {
                    self.delete_remote(&sub.id).await?;
                    delta.orphans_deleted += 1;
                }
            }
        }

        Ok(delta)
    }

    /// Re-runs the sweep every `interval` until cancelled.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(error = %err, "scheduled sweep failed");
                    }
                }
            }
        }
        debug!("periodic sweep stopped");
    }
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod tests;
