//! In-process fakes for the platform and the chat target.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    config::server::{Config, Profile},
    models::{
        Clip, Condition, DesiredFollow, EventKind, FollowKind, PlatformUser, StreamInfo,
        SubscriptionDescriptor, Transport,
    },
};
use tokio_util::sync::CancellationToken;

use crate::{
    app_state::AppState,
    chat::{ChatError, ChatMessage, ChatSink},
    db::store::SqlStore,
    platform::{PlatformApi, PlatformError, PlatformResult},
};

pub const CALLBACK_URL: &str = "https://relay.test/webhook";

#[derive(Default)]
struct PlatformState {
    subscriptions: Vec<SubscriptionDescriptor>,
    users: HashMap<String, PlatformUser>,
    streams: HashMap<String, StreamInfo>,
    clips: HashMap<String, Clip>,
    followers: HashMap<String, u64>,
    create_failures: VecDeque<PlatformError>,
    /// Create answers 409 but the registry keeps whatever it has.
    conflict_on_create: bool,
    delete_failures: HashMap<String, PlatformError>,
    clip_lookup_failures: HashMap<String, PlatformError>,
    clip_listing_failures: HashMap<String, PlatformError>,
    stream_misses: usize,
    next_id: usize,
}

/// Stateful stand-in for the remote subscription registry and entity API.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
    pub create_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap()
    }

    pub fn add_user(&self, id: &str, login: &str) {
        self.state().users.insert(
            login.to_string(),
            PlatformUser {
                id: id.to_string(),
                login: login.to_string(),
                display_name: login.to_uppercase(),
                profile_image_url: None,
            },
        );
    }

    pub fn set_stream(&self, stream: StreamInfo) {
        self.state().streams.insert(stream.user_id.clone(), stream);
    }

    /// The next `misses` stream lookups report the user offline.
    pub fn miss_stream_lookups(&self, misses: usize) {
        self.state().stream_misses = misses;
    }

    pub fn set_followers(&self, user_id: &str, total: u64) {
        self.state().followers.insert(user_id.to_string(), total);
    }

    pub fn add_clip(&self, clip: Clip) {
        self.state().clips.insert(clip.id.clone(), clip);
    }

    pub fn remove_clip(&self, clip_id: &str) {
        self.state().clips.remove(clip_id);
    }

    pub fn rename_clip(&self, clip_id: &str, title: &str) {
        if let Some(clip) = self.state().clips.get_mut(clip_id) {
            clip.title = title.to_string();
        }
    }

    pub fn fail_clip_lookup(&self, clip_id: &str, error: PlatformError) {
        self.state()
            .clip_lookup_failures
            .insert(clip_id.to_string(), error);
    }

    pub fn fail_clip_listing(&self, broadcaster_id: &str, error: PlatformError) {
        self.state()
            .clip_listing_failures
            .insert(broadcaster_id.to_string(), error);
    }

    pub fn fail_next_create(&self, error: PlatformError) {
        self.state().create_failures.push_back(error);
    }

    pub fn conflict_on_create(&self, conflict: bool) {
        self.state().conflict_on_create = conflict;
    }

    pub fn fail_delete(&self, subscription_id: &str, error: PlatformError) {
        self.state()
            .delete_failures
            .insert(subscription_id.to_string(), error);
    }

    pub fn seed_subscription(
        &self,
        id: &str,
        kind: EventKind,
        entity_id: &str,
        callback: &str,
        status: &str,
    ) {
        self.state().subscriptions.push(descriptor(
            id,
            kind,
            entity_id,
            callback,
            status,
        ));
    }

    pub fn remote_subscriptions(&self) -> Vec<SubscriptionDescriptor> {
        self.state().subscriptions.clone()
    }

    pub fn remote_for(&self, entity_id: &str, kind: EventKind) -> Vec<SubscriptionDescriptor> {
        self.remote_subscriptions()
            .into_iter()
            .filter(|sub| sub.entity_id() == Some(entity_id) && sub.event_kind() == Some(kind))
            .collect()
    }
}

pub fn descriptor(
    id: &str,
    kind: EventKind,
    entity_id: &str,
    callback: &str,
    status: &str,
) -> SubscriptionDescriptor {
    SubscriptionDescriptor {
        id: id.to_string(),
        kind: kind.as_str().to_string(),
        status: Some(status.to_string()),
        condition: Condition {
            broadcaster_user_id: Some(entity_id.to_string()),
        },
        transport: Some(Transport {
            method: "webhook".into(),
            callback: Some(callback.to_string()),
        }),
        created_at: Some(Utc::now()),
    }
}

pub fn follow(destination: &str, entity_name: &str, entity_id: &str, kind: FollowKind) -> DesiredFollow {
    DesiredFollow {
        owner_scope: "guild-1".into(),
        destination: destination.to_string(),
        entity_name: entity_name.to_string(),
        entity_id: entity_id.to_string(),
        kind,
        created_at: Utc::now(),
    }
}

pub fn clip(id: &str, broadcaster_id: &str, created_at: DateTime<Utc>) -> Clip {
    Clip {
        id: id.to_string(),
        url: format!("https://clips.test/{id}"),
        broadcaster_id: broadcaster_id.to_string(),
        broadcaster_name: "Streamer".into(),
        creator_name: "viewer".into(),
        title: format!("title of {id}"),
        created_at,
        thumbnail_url: None,
        view_count: 1,
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn create_subscription(
        &self,
        kind: EventKind,
        entity_id: &str,
    ) -> PlatformResult<SubscriptionDescriptor> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }
        if state.conflict_on_create {
            return Err(PlatformError::Conflict);
        }
        let exists = state.subscriptions.iter().any(|sub| {
            sub.event_kind() == Some(kind)
                && sub.entity_id() == Some(entity_id)
                && sub.callback() == Some(CALLBACK_URL)
                && sub.status().is_live()
        });
        if exists {
            return Err(PlatformError::Conflict);
        }
        state.next_id += 1;
        let created = descriptor(
            &format!("sub-{}", state.next_id),
            kind,
            entity_id,
            CALLBACK_URL,
            "enabled",
        );
        state.subscriptions.push(created.clone());
        Ok(created)
    }

    async fn delete_subscription(&self, subscription_id: &str) -> PlatformResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = state.delete_failures.get(subscription_id) {
            return Err(error.clone());
        }
        let before = state.subscriptions.len();
        state.subscriptions.retain(|sub| sub.id != subscription_id);
        if state.subscriptions.len() == before {
            Err(PlatformError::NotFound)
        } else {
            Ok(())
        }
    }

    async fn list_subscriptions(&self) -> PlatformResult<Vec<SubscriptionDescriptor>> {
        Ok(self.state().subscriptions.clone())
    }

    async fn get_user_by_name(&self, login: &str) -> PlatformResult<Option<PlatformUser>> {
        Ok(self.state().users.get(login).cloned())
    }

    async fn get_user_by_id(&self, user_id: &str) -> PlatformResult<Option<PlatformUser>> {
        Ok(self
            .state()
            .users
            .values()
            .find(|user| user.id == user_id)
            .cloned())
    }

    async fn get_stream(&self, user_id: &str) -> PlatformResult<Option<StreamInfo>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.stream_misses > 0 {
            state.stream_misses -= 1;
            return Ok(None);
        }
        Ok(state.streams.get(user_id).cloned())
    }

    async fn get_follower_count(&self, user_id: &str) -> PlatformResult<u64> {
        Ok(self
            .state()
            .followers
            .get(user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn get_clips(
        &self,
        broadcaster_id: &str,
        started_at: DateTime<Utc>,
    ) -> PlatformResult<Vec<Clip>> {
        let state = self.state();
        if let Some(error) = state.clip_listing_failures.get(broadcaster_id) {
            return Err(error.clone());
        }
        // Newest first; callers must sort.
        let mut clips: Vec<Clip> = state
            .clips
            .values()
            .filter(|clip| clip.broadcaster_id == broadcaster_id && clip.created_at >= started_at)
            .cloned()
            .collect();
        clips.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(clips)
    }

    async fn get_clip(&self, clip_id: &str) -> PlatformResult<Option<Clip>> {
        let state = self.state();
        if let Some(error) = state.clip_lookup_failures.get(clip_id) {
            return Err(error.clone());
        }
        Ok(state.clips.get(clip_id).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub destination: String,
    pub handle: String,
    pub message: ChatMessage,
}

#[derive(Default)]
struct ChatState {
    sent: Vec<SentMessage>,
    deleted: Vec<(String, String)>,
    edited: Vec<(String, String, ChatMessage)>,
    failing_destinations: HashSet<String>,
    gone_handles: HashSet<String>,
    next_id: usize,
}

/// Chat target that records every call.
#[derive(Default)]
pub struct RecordingChat {
    state: Mutex<ChatState>,
}

impl RecordingChat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChatState> {
        self.state.lock().unwrap()
    }

    pub fn fail_destination(&self, destination: &str) {
        self.state()
            .failing_destinations
            .insert(destination.to_string());
    }

    /// Simulates a moderator removing the message by hand.
    pub fn mark_gone(&self, handle: &str) {
        self.state().gone_handles.insert(handle.to_string());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state().sent.clone()
    }

    pub fn sent_to(&self, destination: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.destination == destination)
            .collect()
    }

    pub fn deleted(&self) -> Vec<(String, String)> {
        self.state().deleted.clone()
    }

    pub fn edited(&self) -> Vec<(String, String, ChatMessage)> {
        self.state().edited.clone()
    }
}

#[async_trait]
impl ChatSink for RecordingChat {
    async fn send(&self, destination: &str, message: &ChatMessage) -> Result<String, ChatError> {
        let mut state = self.state();
        if state.failing_destinations.contains(destination) {
            return Err(ChatError::Transient("channel unavailable".into()));
        }
        state.next_id += 1;
        let handle = format!("msg-{}", state.next_id);
        state.sent.push(SentMessage {
            destination: destination.to_string(),
            handle: handle.clone(),
            message: message.clone(),
        });
        Ok(handle)
    }

    async fn delete(&self, destination: &str, handle: &str) -> Result<(), ChatError> {
        let mut state = self.state();
        if state.gone_handles.contains(handle) {
            return Err(ChatError::Gone);
        }
        state
            .deleted
            .push((destination.to_string(), handle.to_string()));
        Ok(())
    }

    async fn edit(
        &self,
        destination: &str,
        handle: &str,
        message: &ChatMessage,
    ) -> Result<(), ChatError> {
        let mut state = self.state();
        if state.gone_handles.contains(handle) {
            return Err(ChatError::Gone);
        }
        state.edited.push((
            destination.to_string(),
            handle.to_string(),
            message.clone(),
        ));
        Ok(())
    }
}

/// Fully wired state over an in-memory database and the fakes above.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub store: Arc<SqlStore>,
    pub platform: Arc<FakePlatform>,
    pub chat: Arc<RecordingChat>,
    pub cancel: CancellationToken,
    pub workers: tokio::task::JoinHandle<()>,
}

pub async fn test_app() -> TestApp {
    test_app_with(Config::default_for_profile(Profile::Test)).await
}

pub async fn test_app_with(config: Config) -> TestApp {
    let pool = crate::db::memory_pool().await;
    crate::db::bootstrap::run(&pool)
        .await
        .expect("bootstrap in-memory schema");
    let platform = FakePlatform::new();
    let chat = RecordingChat::new();
    let cancel = CancellationToken::new();
    let (state, workers) = AppState::assemble(
        Arc::new(config),
        pool.clone(),
        platform.clone(),
        chat.clone(),
        cancel.clone(),
    );
    TestApp {
        state: Arc::new(state),
        store: Arc::new(SqlStore::new(pool)),
        platform,
        chat,
        cancel,
        workers,
    }
}
