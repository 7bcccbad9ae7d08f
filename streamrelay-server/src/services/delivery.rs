use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::models::DeliveryRecord;
use tracing::{debug, info, instrument, warn};

use crate::{
    chat::{ChatError, ChatSink},
    db::store::{Store, StoreResult},
};

/// Result of retracting an item from every destination it was delivered to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retraction {
    pub deleted: usize,
    pub already_gone: usize,
    pub failed: usize,
    pub records_erased: u64,
}

/// Cooldown gate plus the item-to-message bookkeeping used for retraction.
pub struct DeliveryTracker {
    store: Arc<dyn Store>,
    chat: Arc<dyn ChatSink>,
}

impl std::fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTracker").finish_non_exhaustive()
    }
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn Store>, chat: Arc<dyn ChatSink>) -> Self {
        Self { store, chat }
    }

    /// `false` iff the pair was delivered to less than `cooldown` ago.
    pub async fn should_deliver(
        &self,
        destination: &str,
        entity_name: &str,
        cooldown: Duration,
    ) -> StoreResult<bool> {
        self.should_deliver_at(destination, entity_name, cooldown, Utc::now())
            .await
    }

    pub async fn should_deliver_at(
        &self,
        destination: &str,
        entity_name: &str,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let Some(last) = self.store.get_cooldown(destination, entity_name).await? else {
            return Ok(true);
        };
        let window = chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX);
        Ok(now - last >= window)
    }

    /// Marks a successful send; overwrites any previous mark.
    pub async fn record_delivery(&self, destination: &str, entity_name: &str) -> StoreResult<()> {
        self.record_delivery_at(destination, entity_name, Utc::now())
            .await
    }

    pub async fn record_delivery_at(
        &self,
        destination: &str,
        entity_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.store.put_cooldown(destination, entity_name, at).await
    }

    /// Remembers which message carries `item_id` at `destination`, replacing
    /// any earlier handle for the pair.
    pub async fn track_item_delivery(
        &self,
        item_id: &str,
        destination: &str,
        handle: &str,
        entity_name: &str,
        title: Option<&str>,
    ) -> StoreResult<()> {
        self.store
            .upsert_delivery(&DeliveryRecord {
                item_id: item_id.to_string(),
                destination: destination.to_string(),
                message_handle: handle.to_string(),
                entity_name: entity_name.to_string(),
                title: title.map(str::to_string),
                created_at: Utc::now(),
            })
            .await
    }

    pub async fn is_delivered(&self, item_id: &str, destination: &str) -> StoreResult<bool> {
        self.store.delivery_exists(item_id, destination).await
    }

    /// Deletes every message posted for `item_id`, then erases its records
    /// whatever the individual deletions returned.
    #[instrument(skip(self))]
    pub async fn retract(&self, item_id: &str) -> StoreResult<Retraction> {
        let records = self.store.deliveries_for_item(item_id).await?;
        let mut outcome = Retraction::default();
        if records.is_empty() {
            debug!("nothing to retract");
            return Ok(outcome);
        }

        for record in &records {
            match self
                .chat
                .delete(&record.destination, &record.message_handle)
                .await
            {
                Ok(()) => outcome.deleted += 1,
                Err(ChatError::Gone) => outcome.already_gone += 1,
                Err(err) => {
                    outcome.failed += 1;
                    warn!(
                        destination = %record.destination,
                        handle = %record.message_handle,
                        error = %err,
                        "failed to delete delivered message"
                    );
                }
            }
        }

        outcome.records_erased = self.store.remove_deliveries_for_item(item_id).await?;
        metrics::counter!("streamrelay_deliveries_total", "kind" => "clip", "outcome" => "retracted")
            .increment(outcome.records_erased);
        info!(
            deleted = outcome.deleted,
            already_gone = outcome.already_gone,
            failed = outcome.failed,
            "retracted item"
        );
        Ok(outcome)
    }
}
