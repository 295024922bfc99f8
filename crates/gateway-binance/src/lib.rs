pub mod client;
pub mod error;
pub mod stream_manager;
pub mod ws_types;

pub use client::BinanceClient;
pub use error::UpstreamError;
pub use stream_manager::{UpstreamHandle, UpstreamStreamManager};
