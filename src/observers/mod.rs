//! Observer registry for live topic subscribers.
//!
//! Every topic keeps a registry of observers. Publishing notifies each live
//! observer once; observers that fail or were not renewed in time are
//! evicted and told their subscription ended, so a dead subscriber can
//! never stall or fail a publish.
//!
//! # Example
//!
//! ```ignore
//! let (observer, mut events) = ChannelObserver::channel(1024);
//! supervisor
//!     .subscribe(&key, SubscribeRequest::new(Arc::new(observer)), &cancel)
//!     .await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ObserverEvent::Message(delivery) => println!("{:?}", delivery.handle),
//!         ObserverEvent::SubscriptionEnded { topic } => break,
//!     }
//! }
//! ```

mod registry;
mod types;

pub use registry::{NotifyOutcome, ObserverRegistry};
pub use types::{
    CallbackObserver, ChannelObserver, Delivery, DeliveryError, MessageObserver, ObserverEvent,
    ObserverReceiver,
};
