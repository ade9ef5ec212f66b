pub mod rest;
pub mod stream;

pub use rest::BybitFutures;
pub use stream::BybitPrivateStream;
