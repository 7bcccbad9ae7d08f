//! Domain models shared between the relay server and its tooling.

pub mod admin;
pub mod credential;
pub mod delivery;
pub mod eventsub;
pub mod follow;
pub mod platform;
pub mod subscription;

pub use admin::{
    FollowListResponse, FollowRequest, FollowView, HealthResponse, StatusResponse, SweepReport,
    UnfollowRequest,
};
pub use credential::Credential;
pub use delivery::DeliveryRecord;
pub use eventsub::{
    ClipDeletedEvent, Condition, EventEnvelope, MessageType, StreamOnlineEvent,
    SubscriptionDescriptor, Transport, VerificationChallenge,
};
pub use follow::{DesiredFollow, FollowKind, ParseFollowKindError};
pub use platform::{Clip, PlatformUser, StreamInfo};
pub use subscription::{EventKind, ParseEventKindError, RemoteSubscription, SubscriptionStatus};
