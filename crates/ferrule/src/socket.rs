//! The byte-stream layer every protocol handler talks to.
//!
//! A [Socket] is non-blocking: `read` and `write` either move some bytes,
//! return `Ok(0)` once the peer is gone (or the socket was closed locally),
//! or fail with [io::ErrorKind::WouldBlock] when the call should be retried
//! after the next readiness edge.

use std::{
    cell::RefCell,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
};

use mio::net::TcpStream;
use tracing::{debug, trace};

pub trait Socket {
    /// Reads into `buf`. `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes some prefix of `buf`. `Ok(0)` means the socket is gone.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Closes the socket. Calling it more than once is a no-op.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Sockets are shared between the layers of a single connection, all of
/// which live on the same acceptor thread.
pub type SharedSocket = Rc<RefCell<dyn Socket>>;

/// An accepted TCP connection.
pub struct TcpSocket {
    stream: Option<TcpStream>,
    fd: RawFd,
    peer: Option<SocketAddr>,
}

impl TcpSocket {
    pub fn new(stream: TcpStream) -> Self {
        let fd = stream.as_raw_fd();
        let peer = stream.peer_addr().ok();
        Self {
            stream: Some(stream),
            fd,
            peer,
        }
    }

    /// The descriptor this socket had when it was accepted. Stays valid as
    /// an identifier after close, but must not be used for i/o.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }
}

impl Socket for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        loop {
            match stream.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => return res,
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        loop {
            match stream.write(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => return res,
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!(fd = self.fd, "closing socket");
            // the peer may already be gone, nothing to do about it
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

/// Wraps a socket with an overflow queue: bytes the kernel (or the TLS
/// engine) would not take are kept and flushed, in order, before anything
/// written later.
pub struct BufferedSocket {
    inner: SharedSocket,
    pending: Vec<u8>,
    pos: usize,
}

impl BufferedSocket {
    pub fn new(inner: SharedSocket) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            pos: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pos < self.pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len() - self.pos
    }

    /// Writes all of `data`, queueing what the socket does not accept right
    /// now. If a backlog exists it is flushed first, and `data` goes to the
    /// back of the queue if the backlog could not be fully flushed.
    ///
    /// Returns how many bytes of `data` went straight to the socket.
    pub fn buffered_write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.flush_pending()?;
        if self.has_pending() {
            self.pending.extend_from_slice(data);
            return Ok(0);
        }

        let mut written = 0;
        while written < data.len() {
            let res = self.inner.borrow_mut().write(&data[written..]);
            match res {
                Ok(0) => {
                    self.close();
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        if written < data.len() {
            trace!(queued = data.len() - written, "socket full, queueing");
            self.pending.extend_from_slice(&data[written..]);
        }
        Ok(written)
    }

    /// Pushes the backlog to the socket, head first, until it is empty or
    /// the socket would block. Returns the number of bytes flushed.
    pub fn flush_pending(&mut self) -> io::Result<usize> {
        let mut flushed = 0;
        while self.has_pending() {
            let res = self.inner.borrow_mut().write(&self.pending[self.pos..]);
            match res {
                Ok(0) => {
                    self.close();
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => {
                    self.pos += n;
                    flushed += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        if !self.has_pending() {
            self.pending.clear();
            self.pos = 0;
        }
        Ok(flushed)
    }
}

impl Socket for BufferedSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.borrow_mut().read(buf)
    }

    /// Direct writes never overtake the backlog: while anything is queued
    /// they report would-block.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flush_pending()?;
        if self.has_pending() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.inner.borrow_mut().write(buf)
    }

    fn close(&mut self) {
        self.pending.clear();
        self.pos = 0;
        self.inner.borrow_mut().close();
    }

    fn is_closed(&self) -> bool {
        self.inner.borrow().is_closed()
    }
}
