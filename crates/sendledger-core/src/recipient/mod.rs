//! Recipient directory: contacts, attributes, and unsubscribe state.

mod model;
mod repository;

pub use model::{AttributePatch, Recipient, RecipientId};
pub use repository::RecipientRepository;
pub(crate) use repository::row_to_recipient;
