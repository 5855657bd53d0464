//! The readiness reactor: one [Listener] thread per port, handing accepted
//! connections round-robin to a pool of [Acceptor] threads, each running
//! its own edge-triggered poll loop.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
};

use mio::Waker;

mod acceptor;
pub use acceptor::*;

mod listener;
pub use listener::*;

#[derive(Debug, Clone)]
pub struct ListenerConf {
    /// Host name or address to bind. `None` binds every interface.
    pub address: Option<String>,

    pub port: u16,

    /// Number of acceptor threads. `None` uses the hardware concurrency.
    pub workers: Option<usize>,

    pub backlog: i32,
}

impl Default for ListenerConf {
    fn default() -> Self {
        Self {
            address: None,
            port: 80,
            workers: None,
            backlog: 1024,
        }
    }
}

/// Startup errors. Once a listener is running, nothing it does fails the
/// process.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("could not resolve {host:?}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("could not listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("could not set up event polling: {0}")]
    Poll(io::Error),

    #[error("could not spawn thread: {0}")]
    Spawn(io::Error),
}

/// Process-wide stop signal, handed to every listener and acceptor when it
/// is built. Triggering it wakes every poll loop that registered with it.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    wakers: Mutex<Vec<Weak<Waker>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let wakers = self
            .inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for waker in wakers.iter().filter_map(Weak::upgrade) {
            // a failed wake means the loop is already gone
            let _ = waker.wake();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, waker: &Arc<Waker>) {
        let mut wakers = self
            .inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        wakers.retain(|w| w.strong_count() > 0);
        wakers.push(Arc::downgrade(waker));
        drop(wakers);

        if self.is_triggered() {
            let _ = waker.wake();
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
