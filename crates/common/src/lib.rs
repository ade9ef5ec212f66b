pub mod config;
pub mod error;
pub mod exchange;
pub mod types;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use exchange::{FuturesMarketData, FuturesOrderExecutor, Kline};
pub use types::*;
