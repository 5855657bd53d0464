use std::{
    cell::RefCell,
    io::{self, Read, Write},
    rc::Rc,
    sync::Arc,
};

use b_x::BX;
use rustls::ServerConnection;
use tracing::{debug, trace};

use crate::{
    error::ServeError,
    event::{Producer, Receiver},
    socket::{SharedSocket, Socket},
};

use super::Protocols;

/// Lets rustls move ciphertext through a [Socket].
struct RawIo<'a>(&'a mut dyn Socket);

impl Read for RawIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for RawIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Pull {
    /// Some records came in and were processed
    Progress,
    /// The raw socket has nothing more right now
    Blocked,
    /// The peer closed its side of the TCP connection
    Eof,
}

/// The plaintext side of a TLS connection. Ciphertext the raw socket does
/// not take stays queued inside the TLS engine and is pushed again on the
/// next write or write-ready signal.
pub struct TlsSocket {
    raw: SharedSocket,
    conn: ServerConnection,
    closed: bool,
}

impl TlsSocket {
    pub fn new(raw: SharedSocket, conn: ServerConnection) -> Self {
        Self {
            raw,
            conn,
            closed: false,
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// The negotiated ALPN protocol, empty if there was none.
    pub fn alpn_protocol(&self) -> String {
        self.conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default()
    }

    pub fn server_name(&self) -> Option<&str> {
        self.conn.server_name()
    }

    /// Reads one batch of ciphertext from the raw socket and feeds it to the
    /// engine.
    fn pull_tls(&mut self) -> Result<Pull, ServeError> {
        if !self.conn.wants_read() {
            return Ok(Pull::Blocked);
        }
        let res = {
            let mut raw = self.raw.borrow_mut();
            self.conn.read_tls(&mut RawIo(&mut *raw))
        };
        match res {
            Ok(0) => Ok(Pull::Eof),
            Ok(n) => {
                trace!(n, "read tls records");
                if let Err(e) = self.conn.process_new_packets() {
                    // best effort: the engine has queued an alert for the peer
                    let _ = self.flush_tls();
                    return Err(e.into());
                }
                Ok(Pull::Progress)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Pull::Blocked),
            Err(e) => Err(e.into()),
        }
    }

    /// Pushes queued ciphertext to the raw socket until it is drained or
    /// the socket would block.
    pub fn flush_tls(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            let res = {
                let mut raw = self.raw.borrow_mut();
                self.conn.write_tls(&mut RawIo(&mut *raw))
            };
            match res {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Moves the handshake along as far as the raw socket allows. Returns
    /// true once it is complete.
    pub fn advance_handshake(&mut self) -> Result<bool, ServeError> {
        loop {
            self.flush_tls()?;
            if !self.conn.is_handshaking() {
                return Ok(true);
            }
            match self.pull_tls()? {
                Pull::Progress => continue,
                Pull::Blocked => return Ok(false),
                Pull::Eof => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during the tls handshake",
                    )
                    .into())
                }
            }
        }
    }
}

impl Socket for TlsSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let mut seen_eof = false;
        loop {
            match self.conn.reader().read(buf) {
                // clean close_notify, or an empty buffer
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                // the peer hung up without a close_notify
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            }
            if seen_eof {
                return Ok(0);
            }

            match self.pull_tls() {
                Ok(Pull::Progress) => {}
                Ok(Pull::Blocked) => return Err(io::ErrorKind::WouldBlock.into()),
                Ok(Pull::Eof) => seen_eof = true,
                Err(ServeError::Io(e)) => return Err(e),
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut n = self.conn.writer().write(buf)?;
        self.flush_tls()?;
        if n == 0 {
            // the engine's plaintext queue was full, the flush may have
            // made room
            n = self.conn.writer().write(buf)?;
            self.flush_tls()?;
        }
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.conn.send_close_notify();
        // the peer may not be listening anymore
        let _ = self.flush_tls();
        self.raw.borrow_mut().close();
    }

    fn is_closed(&self) -> bool {
        self.closed || self.raw.borrow().is_closed()
    }
}

enum State {
    Handshaking,
    Established,
    Closed,
}

/// Receiver sitting between a raw socket and the protocol handler picked
/// by ALPN. It drives the handshake, then forwards readiness upwards.
pub struct TlsLayer {
    socket: Rc<RefCell<TlsSocket>>,
    protocols: Arc<Protocols>,
    state: State,
    next: Producer,
}

impl TlsLayer {
    pub fn new(raw: SharedSocket, conn: ServerConnection, protocols: Arc<Protocols>) -> Self {
        Self {
            socket: Rc::new(RefCell::new(TlsSocket::new(raw, conn))),
            protocols,
            state: State::Handshaking,
            next: Producer::default(),
        }
    }

    fn handshake(&mut self) -> Result<(), BX> {
        let done = self.socket.borrow_mut().advance_handshake()?;
        if !done {
            return Ok(());
        }

        let (alpn, sni) = {
            let socket = self.socket.borrow();
            (socket.alpn_protocol(), socket.server_name().map(str::to_owned))
        };
        debug!(%alpn, ?sni, "tls handshake complete");

        let Some(factory) = self
            .protocols
            .get(&alpn)
            .or_else(|| self.protocols.get(""))
        else {
            return Err(ServeError::NoProtocol(alpn).into());
        };
        let socket: SharedSocket = self.socket.clone();
        let receiver = factory.connect(socket)?;
        self.next.connect(receiver);
        self.state = State::Established;

        // records may have arrived along with the end of the handshake
        self.next.signal_read_avail()?;
        self.next.signal_write_avail()
    }
}

impl Receiver for TlsLayer {
    fn read_avail(&mut self) -> Result<(), BX> {
        match self.state {
            State::Handshaking => self.handshake(),
            State::Established => self.next.signal_read_avail(),
            State::Closed => Ok(()),
        }
    }

    fn write_avail(&mut self) -> Result<(), BX> {
        match self.state {
            State::Handshaking => self.handshake(),
            State::Established => {
                self.socket
                    .borrow_mut()
                    .flush_tls()
                    .map_err(ServeError::from)?;
                self.next.signal_write_avail()
            }
            State::Closed => Ok(()),
        }
    }

    fn closed(&mut self) {
        if matches!(self.state, State::Closed) {
            return;
        }
        self.state = State::Closed;
        self.next.signal_closed();
        self.socket.borrow_mut().close();
    }
}
