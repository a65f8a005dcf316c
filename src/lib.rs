//! Resilient streaming market-data client.
//!
//! [`FeedClient`] multiplexes ticker, trades and candle subscriptions over a
//! pool of websocket connections, keeps each one alive with heartbeats,
//! recovers from silent failures and builds fixed-interval candles from the
//! live stream. Everything it observes is published on an [`EventBus`].

pub mod error;
pub mod events;
pub mod exchange;
pub mod feed;
pub mod market_data;
pub mod runtime_config;
pub mod transport;
pub mod types;

pub use error::FeedError;
pub use events::{EventBus, FeedEvent};
pub use feed::FeedClient;
pub use runtime_config::FeedConfig;
pub use types::{Candle, CandleInterval, Subscription, Ticker, Trade};
