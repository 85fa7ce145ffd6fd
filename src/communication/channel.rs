//! Message-oriented channels that SDP runs over.
//!
//! SDP only needs an ordered, reliable stream of SDUs with a known maximum
//! outgoing size; the L2CAP plumbing that produces one is left to the caller.

use bytes::Bytes;
use tokio::sync::mpsc;

/// An L2CAP Protocol/Service Multiplexer.
pub type Psm = u16;

/// Default maximum SDU size of an L2CAP basic-mode channel.
pub const DEFAULT_MTU: u16 = 672;

/// One end of a bidirectional SDU channel.
///
/// Dropping a `Channel` closes it; the peer observes the closure as
/// [`recv`](Channel::recv) returning `None`.
#[derive(Debug)]
pub struct Channel {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    max_tx_sdu_size: u16,
}

impl Channel {
    pub fn new(
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        max_tx_sdu_size: u16,
    ) -> Self {
        Self {
            tx,
            rx,
            max_tx_sdu_size,
        }
    }

    /// Creates two channels connected to each other.
    pub fn pair(max_tx_sdu_size: u16) -> (Channel, Channel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Channel::new(a_tx, a_rx, max_tx_sdu_size),
            Channel::new(b_tx, b_rx, max_tx_sdu_size),
        )
    }

    /// The largest SDU the peer accepts.
    pub fn max_tx_sdu_size(&self) -> u16 {
        self.max_tx_sdu_size
    }

    /// Queues an SDU for the peer. Returns `false` if the peer has gone away.
    pub fn send(&self, sdu: Bytes) -> bool {
        self.tx.send(sdu).is_ok()
    }

    /// Waits for the next SDU, or `None` once the peer has closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Called with each inbound channel opened on a registered PSM.
pub type ConnectionHandler = Box<dyn FnMut(Channel) + Send>;

/// Accepts inbound L2CAP connections on behalf of the SDP server.
///
/// Implementations must not call back into the server from inside
/// `register` or `unregister`.
pub trait ChannelAcceptor: Send {
    /// Starts routing connections on `psm` to `on_connect`. Returns `false`
    /// if the PSM could not be claimed.
    fn register(&mut self, psm: Psm, on_connect: ConnectionHandler) -> bool;

    /// Stops accepting connections on `psm`.
    fn unregister(&mut self, psm: Psm);
}
