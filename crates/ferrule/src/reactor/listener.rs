use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use mio::{net::TcpListener, Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Type};
use tracing::{debug, info, trace, warn};

use super::{default_workers, Acceptor, ListenError, ListenerConf, Shutdown};
use crate::event::ConnectionFactory;

const LISTENER: Token = Token(0);
const WAKE: Token = Token(1);

/// A bound port and the thread accepting on it. Dropping the listener stops
/// it and its acceptors and waits for all of them.
pub struct Listener {
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds the port, spawns the acceptor pool and starts accepting.
    pub fn bind(
        conf: &ListenerConf,
        factory: Arc<dyn ConnectionFactory>,
        shutdown: &Shutdown,
    ) -> Result<Self, ListenError> {
        let std_listener = bind_socket(conf)?;
        let local_addr = std_listener.local_addr().map_err(|source| ListenError::Bind {
            addr: format!("port {}", conf.port),
            source,
        })?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new().map_err(ListenError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ListenError::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE).map_err(ListenError::Poll)?);
        shutdown.register(&waker);

        let workers = conf.workers.unwrap_or_else(default_workers).max(1);
        let acceptors = (0..workers)
            .map(|id| Acceptor::spawn(id, factory.clone(), shutdown.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let running = Arc::new(AtomicBool::new(true));
        let task = AcceptLoop {
            poll,
            listener,
            acceptors,
            next: 0,
            running: running.clone(),
            shutdown: shutdown.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("ferrule-listener-{}", local_addr.port()))
            .spawn(move || task.run())
            .map_err(ListenError::Spawn)?;

        info!(%local_addr, workers, "listening");
        Ok(Self {
            local_addr,
            waker,
            running,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Asks the accept loop to exit. Safe to call any number of times.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    /// Blocks until the accept loop and all its acceptors have exited.
    pub fn wait(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(addr = %self.local_addr, "listener thread panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

struct AcceptLoop {
    poll: Poll,
    listener: TcpListener,
    acceptors: Vec<Acceptor>,
    next: usize,
    running: Arc<AtomicBool>,
    shutdown: Shutdown,
}

impl AcceptLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);

        while self.running.load(Ordering::SeqCst) && !self.shutdown.is_triggered() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll failed, stopping listener: {e}");
                break;
            }

            if events.iter().any(|ev| ev.token() == LISTENER) {
                self.accept_all();
            }
        }

        for acceptor in &self.acceptors {
            acceptor.stop();
        }
        for acceptor in &mut self.acceptors {
            acceptor.wait();
        }
        debug!("listener stopped");
    }

    /// Edge-triggered: accept until the backlog is empty.
    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, "could not set TCP_NODELAY: {e}");
                    }
                    let acceptor = &self.acceptors[self.next % self.acceptors.len()];
                    self.next = self.next.wrapping_add(1);
                    trace!(%peer, worker = acceptor.id(), "accepted connection");
                    if let Err(e) = acceptor.accept(stream) {
                        warn!(%peer, worker = acceptor.id(), "could not hand off connection: {e}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }
}

fn bind_socket(conf: &ListenerConf) -> Result<std::net::TcpListener, ListenError> {
    let host = conf.address.as_deref().unwrap_or("0.0.0.0");
    let addrs: Vec<SocketAddr> = (host, conf.port)
        .to_socket_addrs()
        .map_err(|source| ListenError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();

    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses to bind");
    for addr in addrs {
        match bind_one(addr, conf.backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(%addr, "bind failed: {e}");
                last_err = e;
            }
        }
    }

    Err(ListenError::Bind {
        addr: format!("{host}:{}", conf.port),
        source: last_err,
    })
}

fn bind_one(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}
