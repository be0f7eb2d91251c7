//! # sendledger-core
//!
//! Core business logic for `SendLedger` campaign delivery.
//!
//! This crate provides:
//! - Recipient directory with segmentation attributes
//! - Segment engine (composable audience filters)
//! - Template store (structured block content, folders)
//! - Campaign orchestration (lifecycle, audience freeze, batch dispatch)
//! - Delivery tracking (per-recipient ledger, event ingestion)
//! - Local storage (`SQLite`)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod campaign;
pub mod delivery;
mod error;
pub mod recipient;
pub mod segment;
mod store;
pub mod template;

pub use campaign::{
    Campaign, CampaignId, CampaignRepository, CampaignStatus, DispatchPolicy, DispatchSummary,
    Dispatcher,
};
pub use delivery::{
    DeliveryEvent, DeliveryRecord, DeliveryRecordId, DeliveryRepository, DeliveryStatus,
    DeliveryTracker, EventType, QueuedDelivery,
};
pub use error::{Error, Result};
pub use recipient::{AttributePatch, Recipient, RecipientId, RecipientRepository};
pub use segment::{CompareOp, FilterExpr, Segment, SegmentId, SegmentRepository};
pub use store::Store;
pub use template::{
    Block, BlockId, BlockKind, ContentTree, Folder, FolderId, Template, TemplateId, TemplatePatch,
    TemplateRepository,
};
