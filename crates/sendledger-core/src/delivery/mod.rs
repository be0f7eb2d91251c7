//! Delivery tracker: per-recipient send/delivery status ledger.

mod model;
mod repository;
mod tracker;

pub use model::{DeliveryEvent, DeliveryRecord, DeliveryRecordId, DeliveryStatus, EventType};
pub use repository::{DeliveryRepository, QueuedDelivery};
pub(crate) use repository::insert_queued;
pub use tracker::DeliveryTracker;
