pub mod protocol;
pub mod rest_client;

pub use protocol::{ack_key, InboundFrame, OutboundFrame, PONG_KEY};
pub use rest_client::{CandleSeeder, NoSeed, RestCandleSeeder};
