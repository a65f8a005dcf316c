pub mod command_queue;
pub mod connection;
pub mod correlator;
pub mod pool;

pub use connection::{ConnectionManager, ConnectionPhase};
pub use correlator::{EventCorrelator, EventWait};
pub use pool::FeedClient;
