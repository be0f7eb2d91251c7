//! Campaign lifecycle: drafting, scheduling, the audience freeze, and
//! batch dispatch.

mod dispatch;
mod model;
mod repository;

pub use dispatch::{DispatchPolicy, DispatchSummary, Dispatcher};
pub use model::{Campaign, CampaignId, CampaignStatus};
pub use repository::CampaignRepository;
