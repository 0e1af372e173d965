//! Upstream market data: the streaming price feed, the per-symbol
//! subscription hub shared by client connections, and a small REST client
//! for quotes, candles and news.

pub mod error;
pub mod hub;
pub mod rest;
pub mod websocket;

pub use error::FeedError;
pub use hub::{FeedHub, SymbolLease};
pub use rest::MarketDataClient;
pub use websocket::{decode_message, FeedCommand, FeedConfig, FeedHandle, PriceFeed, TickStream};
