//! Persistence seam for the relay's bookkeeping.
//!
//! Every write is a single-row statement keyed by the uniqueness constraint
//! of its table, so concurrent writers to the same key never lose updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{
    Credential, DeliveryRecord, DesiredFollow, EventKind, FollowKind, RemoteSubscription,
    SubscriptionStatus,
};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    Duplicate(String),
    #[error("stored value is invalid: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One push subscription that must exist because at least one follow needs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequiredSubscription {
    pub entity_id: String,
    pub entity_name: String,
    pub event_kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowedEntity {
    pub entity_id: String,
    pub entity_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub follows: u64,
    pub checkpoints: u64,
    pub deliveries: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with [`StoreError::Duplicate`] when the follow already exists.
    async fn insert_follow(&self, follow: &DesiredFollow) -> StoreResult<()>;
    async fn remove_follow(
        &self,
        destination: &str,
        entity_name: &str,
        kind: FollowKind,
    ) -> StoreResult<bool>;
    async fn get_follow(
        &self,
        destination: &str,
        entity_name: &str,
        kind: FollowKind,
    ) -> StoreResult<Option<DesiredFollow>>;
    async fn follows_for_destination(&self, destination: &str) -> StoreResult<Vec<DesiredFollow>>;
    async fn follows_for_entity(
        &self,
        entity_name: &str,
        kind: FollowKind,
    ) -> StoreResult<Vec<DesiredFollow>>;
    async fn count_follows(&self, entity_id: &str, kind: FollowKind) -> StoreResult<u64>;
    /// Distinct `(entity, event kind)` pairs with at least one follow.
    async fn required_subscriptions(&self) -> StoreResult<Vec<RequiredSubscription>>;
    async fn followed_entities(&self, kind: FollowKind) -> StoreResult<Vec<FollowedEntity>>;

    /// Insert or replace, keyed by subscription id and by `(entity_id, event_kind)`.
    async fn upsert_subscription(&self, subscription: &RemoteSubscription) -> StoreResult<()>;
    async fn get_subscription_by_entity(
        &self,
        entity_id: &str,
        event_kind: EventKind,
    ) -> StoreResult<Option<RemoteSubscription>>;
    async fn get_subscription_by_id(
        &self,
        subscription_id: &str,
    ) -> StoreResult<Option<RemoteSubscription>>;
    async fn list_subscriptions(&self) -> StoreResult<Vec<RemoteSubscription>>;
    async fn remove_subscription(&self, subscription_id: &str) -> StoreResult<bool>;

    async fn get_checkpoint(&self, entity_name: &str) -> StoreResult<Option<DateTime<Utc>>>;
    /// Moves the checkpoint forward and returns the stored value, which is
    /// never earlier than it was before the call.
    async fn advance_checkpoint(
        &self,
        entity_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>>;
    async fn remove_checkpoint(&self, entity_name: &str) -> StoreResult<()>;

    async fn upsert_delivery(&self, record: &DeliveryRecord) -> StoreResult<()>;
    async fn deliveries_for_item(&self, item_id: &str) -> StoreResult<Vec<DeliveryRecord>>;
    async fn delivery_exists(&self, item_id: &str, destination: &str) -> StoreResult<bool>;
    /// Distinct item ids with at least one delivery created at or after `cutoff`.
    async fn items_delivered_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>>;
    async fn remove_deliveries_for_item(&self, item_id: &str) -> StoreResult<u64>;
    async fn update_delivery_title(
        &self,
        item_id: &str,
        destination: &str,
        title: &str,
    ) -> StoreResult<()>;

    async fn get_cooldown(
        &self,
        destination: &str,
        entity_name: &str,
    ) -> StoreResult<Option<DateTime<Utc>>>;
    async fn put_cooldown(
        &self,
        destination: &str,
        entity_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn load_credential(&self) -> StoreResult<Option<Credential>>;
    async fn save_credential(&self, credential: &Credential) -> StoreResult<()>;

    async fn stats(&self) -> StoreResult<StoreStats>;
}

#[derive(Clone, Debug)]
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_millis(value: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {value}")))
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[derive(FromRow)]
struct FollowRow {
    owner_scope: String,
    destination: String,
    entity_name: String,
    entity_id: String,
    kind: String,
    created_at: i64,
}

impl TryFrom<FollowRow> for DesiredFollow {
    type Error = StoreError;

    fn try_from(row: FollowRow) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: row
                .kind
                .parse()
                .map_err(|err: shared::models::ParseFollowKindError| {
                    StoreError::Corrupt(err.to_string())
                })?,
            created_at: from_millis(row.created_at)?,
            owner_scope: row.owner_scope,
            destination: row.destination,
            entity_name: row.entity_name,
            entity_id: row.entity_id,
        })
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    subscription_id: String,
    entity_name: String,
    entity_id: String,
    event_kind: String,
    status: String,
    updated_at: i64,
}

impl TryFrom<SubscriptionRow> for RemoteSubscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            event_kind: row
                .event_kind
                .parse()
                .map_err(|err: shared::models::ParseEventKindError| {
                    StoreError::Corrupt(err.to_string())
                })?,
            status: SubscriptionStatus::from_remote(&row.status),
            updated_at: from_millis(row.updated_at)?,
            subscription_id: row.subscription_id,
            entity_name: row.entity_name,
            entity_id: row.entity_id,
        })
    }
}

#[derive(FromRow)]
struct DeliveryRow {
    item_id: String,
    destination: String,
    message_handle: String,
    entity_name: String,
    title: Option<String>,
    created_at: i64,
}

impl TryFrom<DeliveryRow> for DeliveryRecord {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            created_at: from_millis(row.created_at)?,
            item_id: row.item_id,
            destination: row.destination,
            message_handle: row.message_handle,
            entity_name: row.entity_name,
            title: row.title,
        })
    }
}

fn collect<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

const FOLLOW_COLUMNS: &str =
    "owner_scope, destination, entity_name, entity_id, kind, created_at";
const SUBSCRIPTION_COLUMNS: &str =
    "subscription_id, entity_name, entity_id, event_kind, status, updated_at";
const DELIVERY_COLUMNS: &str =
    "item_id, destination, message_handle, entity_name, title, created_at";

#[async_trait]
impl Store for SqlStore {
    async fn insert_follow(&self, follow: &DesiredFollow) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO desired_follows \
             (owner_scope, destination, entity_name, entity_id, kind, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&follow.owner_scope)
        .bind(&follow.destination)
        .bind(&follow.entity_name)
        .bind(&follow.entity_id)
        .bind(follow.kind.as_str())
        .bind(follow.created_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::Duplicate(format!(
                    "{} already follows {} ({})",
                    follow.destination, follow.entity_name, follow.kind
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_follow(
        &self,
        destination: &str,
        entity_name: &str,
        kind: FollowKind,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM desired_follows WHERE destination = ? AND entity_name = ? AND kind = ?",
        )
        .bind(destination)
        .bind(entity_name)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_follow(
        &self,
        destination: &str,
        entity_name: &str,
        kind: FollowKind,
    ) -> StoreResult<Option<DesiredFollow>> {
        let row: Option<FollowRow> = sqlx::query_as(&format!(
            "SELECT {FOLLOW_COLUMNS} FROM desired_follows \
             WHERE destination = ? AND entity_name = ? AND kind = ?"
        ))
        .bind(destination)
        .bind(entity_name)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(DesiredFollow::try_from).transpose()
    }

    async fn follows_for_destination(&self, destination: &str) -> StoreResult<Vec<DesiredFollow>> {
        let rows: Vec<FollowRow> = sqlx::query_as(&format!(
            "SELECT {FOLLOW_COLUMNS} FROM desired_follows \
             WHERE destination = ? ORDER BY entity_name, kind"
        ))
        .bind(destination)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn follows_for_entity(
        &self,
        entity_name: &str,
        kind: FollowKind,
    ) -> StoreResult<Vec<DesiredFollow>> {
        let rows: Vec<FollowRow> = sqlx::query_as(&format!(
            "SELECT {FOLLOW_COLUMNS} FROM desired_follows \
             WHERE entity_name = ? AND kind = ? ORDER BY created_at"
        ))
        .bind(entity_name)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn count_follows(&self, entity_id: &str, kind: FollowKind) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM desired_follows WHERE entity_id = ? AND kind = ?",
        )
        .bind(entity_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(to_count(count))
    }

    async fn required_subscriptions(&self) -> StoreResult<Vec<RequiredSubscription>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT entity_id, MIN(entity_name), kind FROM desired_follows \
             GROUP BY entity_id, kind ORDER BY entity_id, kind",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(entity_id, entity_name, kind)| {
                let kind: FollowKind = kind
                    .parse()
                    .map_err(|err: shared::models::ParseFollowKindError| {
                        StoreError::Corrupt(err.to_string())
                    })?;
                Ok(RequiredSubscription {
                    entity_id,
                    entity_name,
                    event_kind: kind.required_event_kind(),
                })
            })
            .collect()
    }

    async fn followed_entities(&self, kind: FollowKind) -> StoreResult<Vec<FollowedEntity>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT entity_id, MIN(entity_name) FROM desired_follows \
             WHERE kind = ? GROUP BY entity_id ORDER BY MIN(entity_name)",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(entity_id, entity_name)| FollowedEntity {
                entity_id,
                entity_name,
            })
            .collect())
    }

    async fn upsert_subscription(&self, subscription: &RemoteSubscription) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO remote_subscriptions \
             (subscription_id, entity_name, entity_id, event_kind, status, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&subscription.subscription_id)
        .bind(&subscription.entity_name)
        .bind(&subscription.entity_id)
        .bind(subscription.event_kind.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        trace!(
            subscription_id = %subscription.subscription_id,
            entity = %subscription.entity_name,
            kind = %subscription.event_kind,
            "stored remote subscription"
        );
        Ok(())
    }

    async fn get_subscription_by_entity(
        &self,
        entity_id: &str,
        event_kind: EventKind,
    ) -> StoreResult<Option<RemoteSubscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM remote_subscriptions \
             WHERE entity_id = ? AND event_kind = ?"
        ))
        .bind(entity_id)
        .bind(event_kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(RemoteSubscription::try_from).transpose()
    }

    async fn get_subscription_by_id(
        &self,
        subscription_id: &str,
    ) -> StoreResult<Option<RemoteSubscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM remote_subscriptions WHERE subscription_id = ?"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RemoteSubscription::try_from).transpose()
    }

    async fn list_subscriptions(&self) -> StoreResult<Vec<RemoteSubscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM remote_subscriptions \
             ORDER BY entity_name, event_kind"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn remove_subscription(&self, subscription_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM remote_subscriptions WHERE subscription_id = ?")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_checkpoint(&self, entity_name: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT last_item_at FROM poll_checkpoints WHERE entity_name = ?")
                .bind(entity_name)
                .fetch_optional(&self.pool)
                .await?;
        value.map(from_millis).transpose()
    }

    async fn advance_checkpoint(
        &self,
        entity_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        let stored: i64 = sqlx::query_scalar(
            "INSERT INTO poll_checkpoints (entity_name, last_item_at) VALUES (?, ?) \
             ON CONFLICT (entity_name) DO UPDATE \
             SET last_item_at = MAX(last_item_at, excluded.last_item_at) \
             RETURNING last_item_at",
        )
        .bind(entity_name)
        .bind(at.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        from_millis(stored)
    }

    async fn remove_checkpoint(&self, entity_name: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM poll_checkpoints WHERE entity_name = ?")
            .bind(entity_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_delivery(&self, record: &DeliveryRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO delivery_records \
             (item_id, destination, message_handle, entity_name, title, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (item_id, destination) DO UPDATE SET \
             message_handle = excluded.message_handle, \
             entity_name = excluded.entity_name, \
             title = excluded.title, \
             created_at = excluded.created_at",
        )
        .bind(&record.item_id)
        .bind(&record.destination)
        .bind(&record.message_handle)
        .bind(&record.entity_name)
        .bind(record.title.as_deref())
        .bind(record.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deliveries_for_item(&self, item_id: &str) -> StoreResult<Vec<DeliveryRecord>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM delivery_records WHERE item_id = ? ORDER BY destination"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn delivery_exists(&self, item_id: &str, destination: &str) -> StoreResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM delivery_records WHERE item_id = ? AND destination = ?",
        )
        .bind(item_id)
        .bind(destination)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn items_delivered_since(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let items: Vec<String> = sqlx::query_scalar(
            "SELECT item_id FROM delivery_records WHERE created_at >= ? \
             GROUP BY item_id ORDER BY MIN(created_at)",
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn remove_deliveries_for_item(&self, item_id: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM delivery_records WHERE item_id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_delivery_title(
        &self,
        item_id: &str,
        destination: &str,
        title: &str,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE delivery_records SET title = ? WHERE item_id = ? AND destination = ?")
            .bind(title)
            .bind(item_id)
            .bind(destination)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_cooldown(
        &self,
        destination: &str,
        entity_name: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let value: Option<i64> = sqlx::query_scalar(
            "SELECT last_delivered_at FROM cooldown_marks WHERE destination = ? AND entity_name = ?",
        )
        .bind(destination)
        .bind(entity_name)
        .fetch_optional(&self.pool)
        .await?;
        value.map(from_millis).transpose()
    }

    async fn put_cooldown(
        &self,
        destination: &str,
        entity_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO cooldown_marks (destination, entity_name, last_delivered_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT (destination, entity_name) DO UPDATE \
             SET last_delivered_at = excluded.last_delivered_at",
        )
        .bind(destination)
        .bind(entity_name)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_credential(&self) -> StoreResult<Option<Credential>> {
        let row: Option<(String, Option<String>, i64)> = sqlx::query_as(
            "SELECT access_token, refresh_token, expires_at FROM platform_credentials WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(access_token, refresh_token, expires_at)| {
            Ok(Credential {
                access_token,
                refresh_token,
                expires_at: from_millis(expires_at)?,
            })
        })
        .transpose()
    }

    async fn save_credential(&self, credential: &Credential) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO platform_credentials \
             (id, access_token, refresh_token, expires_at) VALUES (1, ?, ?, ?)",
        )
        .bind(&credential.access_token)
        .bind(credential.refresh_token.as_deref())
        .bind(credential.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let (follows, checkpoints, deliveries): (i64, i64, i64) = sqlx::query_as(
            "SELECT \
             (SELECT COUNT(*) FROM desired_follows), \
             (SELECT COUNT(*) FROM poll_checkpoints), \
             (SELECT COUNT(*) FROM delivery_records)",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            follows: to_count(follows),
            checkpoints: to_count(checkpoints),
            deliveries: to_count(deliveries),
        })
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
