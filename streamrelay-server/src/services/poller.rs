//! Periodic clip discovery and deletion detection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use shared::{
    config::server::PollingConfig,
    models::{Clip, FollowKind},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{delivery::DeliveryTracker, notifier::Notifier};
use crate::{
    db::store::{FollowedEntity, Store, StoreError},
    platform::{PlatformApi, PlatformError, PlatformResult},
};

/// How far back the first poll of a new entity reaches.
fn default_checkpoint_age() -> chrono::Duration {
    chrono::Duration::hours(24)
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    Present,
    Absent,
    /// The lookup failed in a way that says nothing about the item.
    Unknown,
}

/// Decides whether a failed lookup means the item is gone.
///
/// Only an empty result or one of the configured statuses counts as absence;
/// everything else is treated as "still there" so live content is never
/// retracted by mistake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistencePolicy {
    absent_statuses: Vec<u16>,
}

impl ExistencePolicy {
    pub fn new(absent_statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            absent_statuses: absent_statuses.into_iter().collect(),
        }
    }

    pub fn classify(&self, lookup: &PlatformResult<Option<Clip>>) -> Existence {
        match lookup {
            Ok(Some(_)) => Existence::Present,
            Ok(None) => Existence::Absent,
            Err(err) => match err.status() {
                Some(status) if self.absent_statuses.contains(&status) => Existence::Absent,
                _ => Existence::Unknown,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub entities_checked: usize,
    pub entities_failed: usize,
    pub delivered: usize,
    pub titles_updated: usize,
    pub retracted: usize,
    pub existence_unknown: usize,
}

pub struct Poller {
    store: Arc<dyn Store>,
    platform: Arc<dyn PlatformApi>,
    notifier: Arc<Notifier>,
    tracker: Arc<DeliveryTracker>,
    policy: ExistencePolicy,
    config: PollingConfig,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn window_of(config: &PollingConfig) -> chrono::Duration {
    chrono::Duration::from_std(config.window()).unwrap_or_else(|_| default_checkpoint_age())
}

impl Poller {
    pub fn new(
        store: Arc<dyn Store>,
        platform: Arc<dyn PlatformApi>,
        notifier: Arc<Notifier>,
        tracker: Arc<DeliveryTracker>,
        config: PollingConfig,
    ) -> Self {
        Self {
            store,
            platform,
            notifier,
            tracker,
            policy: ExistencePolicy::new(config.absent_status_codes.iter().copied()),
            config,
        }
    }

    /// Polls after the initial delay and then on every interval tick until
    /// cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(self.config.initial_delay()) => {}
        }

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.poll_once().await;
                    info!(
                        checked = report.entities_checked,
                        failed = report.entities_failed,
                        delivered = report.delivered,
                        retracted = report.retracted,
                        "poll cycle finished"
                    );
                }
            }
        }
        debug!("poller stopped");
    }

    pub async fn poll_once(&self) -> PollReport {
        self.poll_once_at(Utc::now()).await
    }

    /// One full cycle. Never fails: every entity and every deletion check is
    /// isolated and time-bounded.
    #[instrument(skip(self))]
    pub async fn poll_once_at(&self, now: DateTime<Utc>) -> PollReport {
        let mut report = PollReport::default();

        match self.store.followed_entities(FollowKind::Clips).await {
            Ok(entities) => {
                for entity in entities {
                    report.entities_checked += 1;
                    let outcome = tokio::time::timeout(
                        self.config.entity_timeout(),
                        self.poll_entity(&entity, now),
                    )
                    .await;
                    let label = match outcome {
                        Ok(Ok(delivered)) => {
                            report.delivered += delivered;
                            "ok"
                        }
                        Ok(Err(err)) => {
                            report.entities_failed += 1;
                            warn!(entity = %entity.entity_name, error = %err, "entity poll failed");
                            "failed"
                        }
                        Err(_) => {
                            report.entities_failed += 1;
                            warn!(entity = %entity.entity_name, "entity poll timed out, skipped this cycle");
                            "timeout"
                        }
                    };
                    counter!("streamrelay_poll_entities_total", "outcome" => label).increment(1);
                }
            }
            Err(err) => error!(error = %err, "failed to load clip follows"),
        }

        if let Err(err) = self.check_deletions(now, &mut report).await {
            error!(error = %err, "deletion check failed");
        }
        report
    }

    /// Delivers clips newer than the checkpoint, oldest first, and moves the
    /// checkpoint to the last one handled.
    async fn poll_entity(&self, entity: &FollowedEntity, now: DateTime<Utc>) -> Result<usize, PollError> {
        let name = entity.entity_name.as_str();
        let checkpoint = self
            .store
            .get_checkpoint(name)
            .await?
            .unwrap_or_else(|| now - default_checkpoint_age());

        let mut clips = self
            .platform
            .get_clips(&entity.entity_id, now - window_of(&self.config))
            .await?;
        clips.retain(|clip| clip.created_at > checkpoint);
        clips.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut delivered = 0;
        let mut last = None;
        let mut failure = None;
        for clip in &clips {
            match self.notifier.deliver_clip(clip, name).await {
                Ok(fan_out) => {
                    delivered += fan_out.delivered;
                    last = Some(clip.created_at);
                }
                Err(err) => {
                    // Items sharing this timestamp must stay above the checkpoint.
                    last = last.filter(|at| *at < clip.created_at);
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(at) = last {
            let stored = self.store.advance_checkpoint(name, at).await?;
            debug!(entity = name, checkpoint = %stored, "checkpoint advanced");
        }
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(delivered),
        }
    }

    /// Re-checks recently delivered clips: gone ones are retracted, renamed
    /// ones have their messages edited.
    async fn check_deletions(&self, now: DateTime<Utc>, report: &mut PollReport) -> Result<(), PollError> {
        let retention =
            chrono::Duration::from_std(self.config.deletion_retention()).unwrap_or(chrono::Duration::days(7));
        let items = self.store.items_delivered_since(now - retention).await?;

        for item_id in items {
            let lookup = tokio::time::timeout(self.config.entity_timeout(), self.platform.get_clip(&item_id))
                .await
                .unwrap_or_else(|_| Err(PlatformError::Transient("lookup timed out".into())));

            match self.policy.classify(&lookup) {
                Existence::Absent => match self.tracker.retract(&item_id).await {
                    Ok(_) => {
                        info!(item_id = %item_id, "clip no longer exists, retracted");
                        report.retracted += 1;
                    }
                    Err(err) => warn!(item_id = %item_id, error = %err, "retraction failed"),
                },
                Existence::Present => {
                    if let Ok(Some(clip)) = &lookup {
                        match self.notifier.refresh_clip_title(clip).await {
                            Ok(edited) => report.titles_updated += edited,
                            Err(err) => warn!(item_id = %item_id, error = %err, "title refresh failed"),
                        }
                    }
                }
                Existence::Unknown => {
                    report.existence_unknown += 1;
                    debug!(item_id = %item_id, "existence unknown, assuming present");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;
