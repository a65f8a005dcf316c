//! Usage errors surfaced synchronously to callers of the feed client.
//!
//! Transient network failures never appear here: they are retried internally
//! and reported on the event bus instead.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("invalid candle interval '{given}', expected one of: {allowed}")]
    InvalidInterval { given: String, allowed: String },

    #[error("socket is not open, call connect before (un)subscribing")]
    NotConnected,

    #[error("connection still has active subscriptions ({0})")]
    ActiveSubscriptions(usize),
}

pub type Result<T> = std::result::Result<T, FeedError>;
