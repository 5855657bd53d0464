use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
};

use b_x::BX;
use mio::{event::Event, net::TcpStream, Events, Interest, Poll, Token, Waker};
use tracing::{debug, trace, warn};

use super::{ListenError, Shutdown};
use crate::{
    event::{ConnectionFactory, Receiver},
    socket::{SharedSocket, Socket, TcpSocket},
};

const WAKE: Token = Token(usize::MAX);

/// Handle to an acceptor thread. The thread owns every connection handed to
/// it and dispatches their readiness events until it is stopped.
pub struct Acceptor {
    id: usize,
    incoming: mpsc::Sender<TcpStream>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Acceptor {
    pub fn spawn(
        id: usize,
        factory: Arc<dyn ConnectionFactory>,
        shutdown: Shutdown,
    ) -> Result<Self, ListenError> {
        let poll = Poll::new().map_err(ListenError::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE).map_err(ListenError::Poll)?);
        shutdown.register(&waker);

        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let running = running.clone();
            thread::Builder::new()
                .name(format!("ferrule-acceptor-{id}"))
                .spawn(move || {
                    Worker {
                        id,
                        poll,
                        incoming: rx,
                        factory,
                        connections: HashMap::new(),
                        running,
                        shutdown,
                    }
                    .run()
                })
                .map_err(ListenError::Spawn)?
        };

        Ok(Self {
            id,
            incoming: tx,
            waker,
            running,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Hands a non-blocking stream over to this acceptor's thread.
    pub fn accept(&self, stream: TcpStream) -> io::Result<()> {
        self.incoming
            .send(stream)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "acceptor has exited"))?;
        self.waker.wake()
    }

    /// Asks the thread to exit. Safe to call any number of times.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    pub fn wait(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = self.id, "acceptor thread panicked");
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

struct Connection {
    socket: Rc<RefCell<TcpSocket>>,
    receiver: Box<dyn Receiver>,
}

struct Worker {
    id: usize,
    poll: Poll,
    incoming: mpsc::Receiver<TcpStream>,
    factory: Arc<dyn ConnectionFactory>,
    connections: HashMap<Token, Connection>,
    running: Arc<AtomicBool>,
    shutdown: Shutdown,
}

impl Worker {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.shutdown.is_triggered()
    }

    fn run(mut self) {
        debug!(worker = self.id, "acceptor started");
        let mut events = Events::with_capacity(1024);

        while self.is_running() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(worker = self.id, "poll failed, stopping acceptor: {e}");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKE => self.drain_incoming(),
                    token => self.dispatch(token, event),
                }
            }
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token);
        }
        debug!(worker = self.id, "acceptor stopped");
    }

    fn drain_incoming(&mut self) {
        loop {
            match self.incoming.try_recv() {
                Ok(stream) => self.register(stream),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    fn register(&mut self, stream: TcpStream) {
        let socket = Rc::new(RefCell::new(TcpSocket::new(stream)));
        let fd = socket.borrow().fd();
        let token = Token(fd as usize);

        {
            let mut socket = socket.borrow_mut();
            let Some(stream) = socket.stream_mut() else {
                return;
            };
            if let Err(e) = self.poll.registry().register(
                stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!(worker = self.id, fd, "could not register connection: {e}");
                socket.close();
                return;
            }
        }

        let shared: SharedSocket = socket.clone();
        let factory = &self.factory;
        let receiver = match panic::catch_unwind(AssertUnwindSafe(|| factory.connect(shared))) {
            Ok(Ok(receiver)) => receiver,
            Ok(Err(e)) => {
                warn!(worker = self.id, fd, "could not set up connection: {e}");
                socket.borrow_mut().close();
                return;
            }
            Err(_) => {
                warn!(worker = self.id, fd, "connection factory panicked");
                socket.borrow_mut().close();
                return;
            }
        };

        trace!(worker = self.id, fd, peer = ?socket.borrow().peer_addr(), "connection registered");
        if let Some(mut stale) = self
            .connections
            .insert(token, Connection { socket, receiver })
        {
            stale.receiver.closed();
        }
    }

    fn dispatch(&mut self, token: Token, event: &Event) {
        let Some(conn) = self.connections.get_mut(&token) else {
            trace!(worker = self.id, ?token, "event for unknown connection");
            return;
        };

        let keep = if event.is_error() || event.is_read_closed() || event.is_write_closed() {
            debug!(worker = self.id, fd = token.0, "peer hung up");
            false
        } else {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), BX> {
                if event.is_readable() {
                    conn.receiver.read_avail()?;
                }
                if event.is_writable() && !conn.socket.borrow().is_closed() {
                    conn.receiver.write_avail()?;
                }
                Ok(())
            }));
            match outcome {
                Ok(Ok(())) => !conn.socket.borrow().is_closed(),
                Ok(Err(e)) => {
                    debug!(worker = self.id, fd = token.0, "closing connection: {e}");
                    false
                }
                Err(_) => {
                    warn!(worker = self.id, fd = token.0, "connection handler panicked");
                    false
                }
            }
        };

        if !keep {
            self.close(token);
        }
    }

    /// Removes the connection from the table, tells its receiver chain and
    /// closes the socket. The entry is gone after the first call.
    fn close(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| conn.receiver.closed())).is_err() {
            warn!(worker = self.id, fd = token.0, "close handler panicked");
        }
        conn.socket.borrow_mut().close();
        trace!(worker = self.id, fd = token.0, open = self.connections.len(), "connection closed");
    }
}
