use super::*;
use crate::{
    db::{bootstrapped_store, store::SqlStore},
    test_support::{FakePlatform, RecordingChat, clip, follow},
};
use chrono::Utc;
use std::sync::atomic::Ordering;

struct Harness {
    notifier: Notifier,
    store: Arc<SqlStore>,
    platform: Arc<FakePlatform>,
    chat: Arc<RecordingChat>,
}

fn quick_config() -> NotificationConfig {
    NotificationConfig {
        cooldown_secs: 30,
        live_initial_delay_secs: 0,
        live_retry_count: 3,
        live_retry_backoff_secs: 0,
    }
}

async fn harness() -> Harness {
    let store = Arc::new(bootstrapped_store().await);
    let platform = FakePlatform::new();
    let chat = RecordingChat::new();
    let tracker = Arc::new(DeliveryTracker::new(store.clone(), chat.clone()));
    let notifier = Notifier::new(
        store.clone(),
        platform.clone(),
        chat.clone(),
        tracker,
        quick_config(),
    );
    Harness {
        notifier,
        store,
        platform,
        chat,
    }
}

fn online_event() -> StreamOnlineEvent {
    StreamOnlineEvent {
        id: Some("evt-1".into()),
        broadcaster_user_id: "1337".into(),
        broadcaster_user_login: "Cool_Streamer".into(),
        broadcaster_user_name: Some("Cool_Streamer".into()),
        stream_type: Some("live".into()),
        started_at: Some(Utc::now()),
        category_name: Some("Celeste".into()),
    }
}

fn stream() -> StreamInfo {
    StreamInfo {
        user_id: "1337".into(),
        user_login: "cool_streamer".into(),
        user_name: "Cool_Streamer".into(),
        game_name: "Celeste".into(),
        title: "any% attempts".into(),
        viewer_count: 12,
        thumbnail_url: Some("https://cdn.test/live_{width}x{height}.jpg".into()),
        started_at: None,
    }
}

async fn follow_live(store: &SqlStore, destination: &str) {
    store
        .insert_follow(&follow(destination, "cool_streamer", "1337", FollowKind::Live))
        .await
        .unwrap();
}

#[tokio::test]
async fn live_event_reaches_every_following_destination() {
    let h = harness().await;
    follow_live(&h.store, "chan-a").await;
    follow_live(&h.store, "chan-b").await;
    h.platform.set_stream(stream());
    h.platform.set_followers("1337", 99);

    let fan_out = h.notifier.on_stream_online(&online_event()).await.unwrap();
    assert_eq!(fan_out.delivered, 2);
    assert_eq!(h.chat.sent().len(), 2);

    let embed = &h.chat.sent_to("chan-a")[0].message.embeds[0];
    assert_eq!(embed.description.as_deref(), Some("any% attempts"));
    assert_eq!(embed.fields[1].value, "99");
}

#[tokio::test]
async fn repeated_live_event_is_suppressed_by_cooldown() {
    let h = harness().await;
    follow_live(&h.store, "chan-a").await;
    h.platform.set_stream(stream());

    h.notifier.on_stream_online(&online_event()).await.unwrap();
    let second = h.notifier.on_stream_online(&online_event()).await.unwrap();

    assert_eq!(second.skipped, 1);
    assert_eq!(h.chat.sent().len(), 1);
}

#[tokio::test]
async fn missing_stream_data_degrades_instead_of_dropping() {
    let h = harness().await;
    follow_live(&h.store, "chan-a").await;
    h.platform.miss_stream_lookups(10);

    let fan_out = h.notifier.on_stream_online(&online_event()).await.unwrap();
    assert_eq!(fan_out.delivered, 1);
    assert_eq!(h.platform.stream_calls.load(Ordering::SeqCst), 3);

    let embed = &h.chat.sent()[0].message.embeds[0];
    assert_eq!(embed.description.as_deref(), Some("Live Stream"));
    assert_eq!(embed.fields[0].value, "Celeste");
}

#[tokio::test]
async fn stream_retry_stops_once_data_appears() {
    let h = harness().await;
    follow_live(&h.store, "chan-a").await;
    h.platform.set_stream(stream());
    h.platform.miss_stream_lookups(1);

    h.notifier.on_stream_online(&online_event()).await.unwrap();
    assert_eq!(h.platform.stream_calls.load(Ordering::SeqCst), 2);
    let embed = &h.chat.sent()[0].message.embeds[0];
    assert!(embed.image.is_some());
}

#[tokio::test]
async fn one_failing_destination_does_not_block_the_others() {
    let h = harness().await;
    follow_live(&h.store, "chan-a").await;
    follow_live(&h.store, "chan-b").await;
    h.platform.set_stream(stream());
    h.chat.fail_destination("chan-a");

    let fan_out = h.notifier.on_stream_online(&online_event()).await.unwrap();
    assert_eq!(fan_out.delivered, 1);
    assert_eq!(fan_out.failed, 1);

    // The failed destination keeps no cooldown and gets the next event.
    let cooldown = h.store.get_cooldown("chan-a", "cool_streamer").await.unwrap();
    assert!(cooldown.is_none());
}

#[tokio::test]
async fn clip_is_delivered_once_per_destination() {
    let h = harness().await;
    h.store
        .insert_follow(&follow("chan-a", "cool_streamer", "1337", FollowKind::Clips))
        .await
        .unwrap();
    let item = clip("clip-1", "1337", Utc::now());

    let first = h.notifier.deliver_clip(&item, "cool_streamer").await.unwrap();
    let second = h.notifier.deliver_clip(&item, "cool_streamer").await.unwrap();

    assert_eq!(first.delivered, 1);
    assert_eq!(second.skipped, 1);
    assert_eq!(h.chat.sent().len(), 1);
    let records = h.store.deliveries_for_item("clip-1").await.unwrap();
    assert_eq!(records[0].message_handle, h.chat.sent()[0].handle);
    assert_eq!(records[0].title.as_deref(), Some("title of clip-1"));
}

#[tokio::test]
async fn renamed_clip_edits_the_delivered_message() {
    let h = harness().await;
    h.store
        .insert_follow(&follow("chan-a", "cool_streamer", "1337", FollowKind::Clips))
        .await
        .unwrap();
    let mut item = clip("clip-1", "1337", Utc::now());
    h.notifier.deliver_clip(&item, "cool_streamer").await.unwrap();

    assert_eq!(h.notifier.refresh_clip_title(&item).await.unwrap(), 0);

    item.title = "better title".into();
    assert_eq!(h.notifier.refresh_clip_title(&item).await.unwrap(), 1);
    let edited = h.chat.edited();
    assert_eq!(edited.len(), 1);
    assert!(edited[0].2.content.as_deref().unwrap().contains("better title"));
    // Stored title follows the edit, so a second pass is a no-op.
    assert_eq!(h.notifier.refresh_clip_title(&item).await.unwrap(), 0);
}

#[tokio::test]
async fn clip_deletion_job_retracts_messages() {
    let h = harness().await;
    h.store
        .insert_follow(&follow("chan-a", "cool_streamer", "1337", FollowKind::Clips))
        .await
        .unwrap();
    h.notifier
        .deliver_clip(&clip("clip-1", "1337", Utc::now()), "cool_streamer")
        .await
        .unwrap();

    h.notifier
        .handle(Job::ClipDeleted(ClipDeletedEvent {
            id: "clip-1".into(),
            broadcaster_user_id: Some("1337".into()),
            broadcaster_user_login: None,
        }))
        .await
        .unwrap();

    assert_eq!(h.chat.deleted().len(), 1);
    assert!(h.store.deliveries_for_item("clip-1").await.unwrap().is_empty());
}
