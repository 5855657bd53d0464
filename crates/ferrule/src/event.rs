//! Readiness plumbing between the layers of a connection.
//!
//! Every layer is a [Receiver] for the layer below it and owns a [Producer]
//! holding the layer above it. Ownership only ever points upwards, so there
//! are no cycles: a receiver talks back to the wire through the socket it was
//! built with, never through its producer.

use b_x::BX;

use crate::socket::SharedSocket;

pub trait Receiver {
    /// Bytes can be read without blocking. Edge-triggered: callers must read
    /// until the socket reports would-block.
    fn read_avail(&mut self) -> Result<(), BX>;

    /// The socket can take more bytes.
    fn write_avail(&mut self) -> Result<(), BX>;

    /// The connection is gone. Called at most once.
    fn closed(&mut self);
}

/// Holds at most one downstream receiver and forwards signals to it.
#[derive(Default)]
pub struct Producer {
    receiver: Option<Box<dyn Receiver>>,
}

impl Producer {
    /// Attaches `receiver`, returning the one it replaces. The replaced
    /// receiver gets no further signals from this producer.
    pub fn connect(&mut self, receiver: Box<dyn Receiver>) -> Option<Box<dyn Receiver>> {
        self.receiver.replace(receiver)
    }

    pub fn disconnect(&mut self) -> Option<Box<dyn Receiver>> {
        self.receiver.take()
    }

    pub fn is_connected(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn signal_read_avail(&mut self) -> Result<(), BX> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.read_avail(),
            None => Ok(()),
        }
    }

    pub fn signal_write_avail(&mut self) -> Result<(), BX> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.write_avail(),
            None => Ok(()),
        }
    }

    /// Forwards the close and detaches, so the receiver hears it once.
    pub fn signal_closed(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.closed();
        }
    }
}

/// Builds the receiver chain for a freshly accepted (or freshly negotiated)
/// connection. Factories are shared by every acceptor thread; the receivers
/// they build stay on the thread that built them.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn connect(&self, socket: SharedSocket) -> Result<Box<dyn Receiver>, BX>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(SharedSocket) -> Result<Box<dyn Receiver>, BX> + Send + Sync + 'static,
{
    fn connect(&self, socket: SharedSocket) -> Result<Box<dyn Receiver>, BX> {
        self(socket)
    }
}
