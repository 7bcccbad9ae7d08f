//! Relay engines: reconciliation, polling, delivery and the job dispatcher.
pub mod delivery;
pub mod dispatcher;
pub mod follow_service;
pub mod keyed_lock;
pub mod notifier;
pub mod poller;
pub mod reconciler;
pub mod render;
pub mod signature;

pub use delivery::DeliveryTracker;
pub use dispatcher::{Dispatcher, Job, JobHandler};
pub use follow_service::{FollowError, FollowService};
pub use notifier::Notifier;
pub use poller::Poller;
pub use reconciler::Reconciler;
