use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use shared::{
    config::server::NotificationConfig,
    models::{Clip, ClipDeletedEvent, DesiredFollow, FollowKind, StreamInfo, StreamOnlineEvent},
};
use tracing::{debug, error, info, instrument, warn};

use super::{
    delivery::{DeliveryTracker, Retraction},
    dispatcher::{Job, JobHandler},
    render::{self, LiveSnapshot},
};
use crate::{
    chat::{ChatError, ChatMessage, ChatSink},
    db::store::{Store, StoreResult},
    platform::PlatformApi,
};

/// Per-destination results of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Skipped,
    Failed,
}

impl FanOut {
    fn from_outcomes(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        outcomes
            .into_iter()
            .fold(Self::default(), |mut fan_out, outcome| {
                match outcome {
                    Outcome::Delivered => fan_out.delivered += 1,
                    Outcome::Skipped => fan_out.skipped += 1,
                    Outcome::Failed => fan_out.failed += 1,
                }
                fan_out
            })
    }
}

fn count(kind: &'static str, fan_out: FanOut) {
    metrics::counter!("streamrelay_deliveries_total", "kind" => kind, "outcome" => "delivered")
        .increment(fan_out.delivered as u64);
    metrics::counter!("streamrelay_deliveries_total", "kind" => kind, "outcome" => "skipped")
        .increment(fan_out.skipped as u64);
    metrics::counter!("streamrelay_deliveries_total", "kind" => kind, "outcome" => "failed")
        .increment(fan_out.failed as u64);
}

/// Turns platform events into chat messages for every following destination.
pub struct Notifier {
    store: Arc<dyn Store>,
    platform: Arc<dyn PlatformApi>,
    chat: Arc<dyn ChatSink>,
    tracker: Arc<DeliveryTracker>,
    config: NotificationConfig,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(
        store: Arc<dyn Store>,
        platform: Arc<dyn PlatformApi>,
        chat: Arc<dyn ChatSink>,
        tracker: Arc<DeliveryTracker>,
        config: NotificationConfig,
    ) -> Self {
        Self {
            store,
            platform,
            chat,
            tracker,
            config,
        }
    }

    /// Go-live path. Always produces a delivery for each destination outside
    /// its cooldown, falling back to a degraded layout when stream data never
    /// shows up.
    #[instrument(skip(self, event), fields(entity = %event.broadcaster_user_login))]
    pub async fn on_stream_online(&self, event: &StreamOnlineEvent) -> StoreResult<FanOut> {
        let entity_name = event.broadcaster_user_login.to_lowercase();
        let follows = self
            .store
            .follows_for_entity(&entity_name, FollowKind::Live)
            .await?;
        if follows.is_empty() {
            debug!("no destinations follow this entity");
            return Ok(FanOut::default());
        }

        tokio::time::sleep(self.config.live_initial_delay()).await;

        let user_id = event.broadcaster_user_id.as_str();
        let (stream, followers, user) = tokio::join!(
            self.fetch_stream(user_id),
            self.platform.get_follower_count(user_id),
            self.platform.get_user_by_id(user_id),
        );

        let snapshot = stream.as_ref().map_or_else(
            || {
                warn!("stream data unavailable, sending degraded notification");
                LiveSnapshot::degraded(event)
            },
            LiveSnapshot::from_stream,
        );
        let followers = followers
            .inspect_err(|err| warn!(error = %err, "failed to fetch follower count"))
            .ok();
        let avatar = user
            .ok()
            .flatten()
            .and_then(|user| user.profile_image_url);

        let message = render::live_message(event, &snapshot, followers, avatar.as_deref());
        let outcomes = join_all(
            follows
                .iter()
                .map(|follow| self.deliver_live(follow, &entity_name, &message)),
        )
        .await;

        let fan_out = FanOut::from_outcomes(outcomes);
        count("live", fan_out);
        info!(
            delivered = fan_out.delivered,
            skipped = fan_out.skipped,
            failed = fan_out.failed,
            degraded = stream.is_none(),
            "live notification fan-out finished"
        );
        Ok(fan_out)
    }

    async fn fetch_stream(&self, user_id: &str) -> Option<StreamInfo> {
        let attempts = self.config.live_retry_count.max(1);
        for attempt in 1..=attempts {
            match self.platform.get_stream(user_id).await {
                Ok(Some(stream)) => return Some(stream),
                Ok(None) => debug!(attempt, "stream not visible yet"),
                Err(err) => warn!(attempt, error = %err, "stream lookup failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.live_retry_backoff()).await;
            }
        }
        None
    }

    async fn deliver_live(
        &self,
        follow: &DesiredFollow,
        entity_name: &str,
        message: &ChatMessage,
    ) -> Outcome {
        let destination = follow.destination.as_str();
        match self
            .tracker
            .should_deliver(destination, entity_name, self.config.cooldown())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(destination, "destination is cooling down");
                return Outcome::Skipped;
            }
            Err(err) => {
                error!(destination, error = %err, "cooldown lookup failed");
                return Outcome::Failed;
            }
        }

        match self.chat.send(destination, message).await {
            Ok(_) => {
                if let Err(err) = self.tracker.record_delivery(destination, entity_name).await {
                    error!(destination, error = %err, "failed to record cooldown");
                }
                Outcome::Delivered
            }
            Err(err) => {
                warn!(destination, error = %err, "failed to send live notification");
                Outcome::Failed
            }
        }
    }

    /// Delivers a clip to every clip-following destination that has not
    /// received it yet.
    #[instrument(skip(self, clip), fields(clip_id = %clip.id))]
    pub async fn deliver_clip(&self, clip: &Clip, entity_name: &str) -> StoreResult<FanOut> {
        let follows = self
            .store
            .follows_for_entity(entity_name, FollowKind::Clips)
            .await?;
        let message = render::clip_message(clip);

        let outcomes = join_all(
            follows
                .iter()
                .map(|follow| self.deliver_clip_to(&follow.destination, entity_name, clip, &message)),
        )
        .await;

        let fan_out = FanOut::from_outcomes(outcomes);
        count("clip", fan_out);
        Ok(fan_out)
    }

    async fn deliver_clip_to(
        &self,
        destination: &str,
        entity_name: &str,
        clip: &Clip,
        message: &ChatMessage,
    ) -> Outcome {
        match self.tracker.is_delivered(&clip.id, destination).await {
            Ok(false) => {}
            Ok(true) => return Outcome::Skipped,
            Err(err) => {
                error!(destination, error = %err, "delivery lookup failed");
                return Outcome::Failed;
            }
        }

        match self.chat.send(destination, message).await {
            Ok(handle) => {
                if let Err(err) = self
                    .tracker
                    .track_item_delivery(
                        &clip.id,
                        destination,
                        &handle,
                        entity_name,
                        Some(&clip.title),
                    )
                    .await
                {
                    error!(destination, error = %err, "clip sent but delivery record not stored");
                }
                Outcome::Delivered
            }
            Err(err) => {
                warn!(destination, error = %err, "failed to send clip notification");
                Outcome::Failed
            }
        }
    }

    /// Edits already-delivered messages whose clip title has since changed.
    pub async fn refresh_clip_title(&self, clip: &Clip) -> StoreResult<usize> {
        let records = self.store.deliveries_for_item(&clip.id).await?;
        let message = render::clip_message(clip);
        let mut edited = 0;

        for record in records
            .iter()
            .filter(|record| record.title.as_deref() != Some(clip.title.as_str()))
        {
            match self
                .chat
                .edit(&record.destination, &record.message_handle, &message)
                .await
            {
                Ok(()) => {
                    self.store
                        .update_delivery_title(&clip.id, &record.destination, &clip.title)
                        .await?;
                    edited += 1;
                }
                Err(ChatError::Gone) => {
                    debug!(destination = %record.destination, "edited message no longer exists");
                }
                Err(err) => {
                    warn!(destination = %record.destination, error = %err, "failed to edit clip message");
                }
            }
        }

        Ok(edited)
    }

    pub async fn on_clip_deleted(&self, event: &ClipDeletedEvent) -> StoreResult<Retraction> {
        self.tracker.retract(&event.id).await
    }
}

#[async_trait]
impl JobHandler for Notifier {
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        match job {
            Job::StreamOnline(event) => {
                self.on_stream_online(&event).await?;
            }
            Job::ClipDeleted(event) => {
                self.on_clip_deleted(&event).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "notifier_tests.rs"]
mod tests;
