use std::{sync::Arc, time::Instant};

use shared::config::server::Config;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    chat::ChatSink,
    db::store::{SqlStore, Store},
    handlers::webhook::RecentMessageIds,
    platform::PlatformApi,
    services::{
        DeliveryTracker, Dispatcher, FollowService, JobHandler, Notifier, Poller, Reconciler,
    },
};

/// Everything the routes and background workers share.
pub struct AppState {
    pub(crate) config: Arc<Config>,
    pub(crate) pool: SqlitePool,
    pub(crate) reconciler: Arc<Reconciler>,
    pub(crate) follows: Arc<FollowService>,
    pub(crate) poller: Arc<Poller>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) recent_messages: RecentMessageIds,
    pub(crate) started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("profile", &self.config.profile)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Builds the service graph over the given pool and outbound clients and
    /// starts the job workers. The returned handle completes once `cancel`
    /// fires and in-flight jobs have drained.
    pub fn assemble(
        config: Arc<Config>,
        pool: SqlitePool,
        platform: Arc<dyn PlatformApi>,
        chat: Arc<dyn ChatSink>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let store: Arc<dyn Store> = Arc::new(SqlStore::new(pool.clone()));
        let tracker = Arc::new(DeliveryTracker::new(store.clone(), chat.clone()));
        let notifier = Arc::new(Notifier::new(
            store.clone(),
            platform.clone(),
            chat,
            tracker.clone(),
            config.notifications.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            platform.clone(),
            config.webhook.callback_url.clone(),
            config.reconciliation.clone(),
        ));
        let follows = Arc::new(FollowService::new(
            store.clone(),
            platform.clone(),
            reconciler.clone(),
        ));
        let poller = Arc::new(Poller::new(
            store.clone(),
            platform,
            notifier.clone(),
            tracker,
            config.polling.clone(),
        ));

        let handler: Arc<dyn JobHandler> = notifier;
        let (dispatcher, workers) = Dispatcher::spawn(handler, &config.dispatch, cancel);

        let state = Self {
            recent_messages: RecentMessageIds::new(config.dispatch.recent_message_ids),
            config,
            pool,
            reconciler,
            follows,
            poller,
            dispatcher,
            started_at: Instant::now(),
        };
        (state, workers)
    }
}
