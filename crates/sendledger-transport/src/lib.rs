//! # sendledger-transport
//!
//! Boundary between sendledger and the hosted mail delivery service.
//!
//! This crate provides:
//! - The [`Transport`] trait and its HTTP implementation
//! - Outbound [`SendRequest`] / [`SubmissionReceipt`] types
//! - Inbound webhook payloads with HMAC signature verification
//! - Transient/permanent error classification for retry decisions

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod client;
mod error;
mod message;
pub mod webhook;

pub use client::{HttpTransport, Transport};
pub use error::{Error, Result};
pub use message::{SendRequest, SubmissionReceipt};
pub use webhook::EventPayload;
