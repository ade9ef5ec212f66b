pub mod rest;
pub mod stream;

pub use rest::BinanceFutures;
pub use stream::BinanceUserStream;
