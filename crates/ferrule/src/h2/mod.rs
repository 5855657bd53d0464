//! HTTP/2 serving: a sans-io framing session, driven by a handler that maps
//! streams onto requests.

pub mod frame;

mod session;
pub use session::*;

mod server;
pub use server::*;
