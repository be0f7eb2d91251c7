//! Segment engine: declarative audience filters over the recipient directory.

mod model;
mod repository;

pub use model::{CompareOp, FilterExpr, MAX_FILTER_DEPTH, Segment, SegmentId};
pub use repository::SegmentRepository;
pub(crate) use repository::{AUDIENCE_QUERY, apply_filter};
