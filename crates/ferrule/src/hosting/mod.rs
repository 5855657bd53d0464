//! Request handlers and the chain that picks one.

use std::{io, path::PathBuf, sync::Arc};

use tracing::debug;

use crate::{Request, Response};

mod mime;
pub use mime::*;

mod static_files;
pub use static_files::*;

/// Something that may answer a request. Handlers are shared by every
/// acceptor thread.
pub trait RequestHandler: Send + Sync + 'static {
    /// Returns `None` to let the next handler in the chain try.
    fn handle(&self, request: &Request) -> Option<Response>;
}

/// Handlers tried in order; the first answer wins, and nobody answering
/// yields the fixed 404.
#[derive(Default, Clone)]
pub struct HostingChain {
    handlers: Vec<Arc<dyn RequestHandler>>,
}

impl HostingChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handler: impl RequestHandler) -> &mut Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn respond(&self, request: &Request) -> Response {
        for handler in &self.handlers {
            if let Some(response) = handler.handle(request) {
                return response;
            }
        }
        debug!(path = %request.path, "no handler answered");
        Response::not_found()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostingError {
    #[error("document root must not be empty or /")]
    UnsafeRoot,

    #[error("document root {path:?} is unusable: {source}")]
    Root { path: PathBuf, source: io::Error },

    #[error("document root {0:?} is not a directory")]
    NotADirectory(PathBuf),
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::{HostingChain, RequestHandler};
    use crate::{Request, Response};

    struct Only(&'static str);

    impl RequestHandler for Only {
        fn handle(&self, request: &Request) -> Option<Response> {
            (request.path == self.0).then(|| Response {
                status: StatusCode::NO_CONTENT,
                ..Default::default()
            })
        }
    }

    #[test]
    fn first_answer_wins_and_silence_is_404() {
        let mut chain = HostingChain::new();
        chain.push(Only("/a")).push(Only("/b"));

        let mut req = Request {
            path: "/b".into(),
            ..Default::default()
        };
        assert_eq!(chain.respond(&req).status, StatusCode::NO_CONTENT);

        req.path = "/c".into();
        let res = chain.respond(&req);
        assert_eq!(res.status, StatusCode::NOT_FOUND);
        assert_eq!(&res.body[..], b"Not Found");

        assert_eq!(
            HostingChain::new().respond(&req).status,
            StatusCode::NOT_FOUND
        );
    }
}
