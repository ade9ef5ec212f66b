pub mod rest;
pub mod stream;

pub use rest::BitgetFutures;
pub use stream::BitgetPrivateStream;
