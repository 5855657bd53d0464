mod types;
pub use types::*;

pub mod error;
pub mod event;
pub mod hosting;
pub mod reactor;
pub mod socket;
pub mod tls;

pub mod h1;
pub mod h2;

/// re-exported so consumers can use whatever version we use
pub use bytes;
pub use http;
