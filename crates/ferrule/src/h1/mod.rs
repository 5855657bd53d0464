//! HTTP/1.1 serving: an incremental parser feeding a handler that answers
//! pipelined requests strictly in order.

mod encode;

mod parser;
pub use parser::*;

mod server;
pub use server::*;
