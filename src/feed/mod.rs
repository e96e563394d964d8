//! Live market-data feed.
//!
//! - `buffer`: FIFO between transport and ingestion
//! - `session`: connection state and reconnect backoff
//! - `binance_ws`: combined-stream websocket client

pub mod binance_ws;
pub mod buffer;
pub mod session;

pub use binance_ws::BinanceStreamClient;
pub use buffer::{FeedBuffer, StreamBuffer};
pub use session::{ReconnectBackoff, SessionState};
