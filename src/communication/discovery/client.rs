use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{ready, Stream};
use log::{debug, info, trace, warn};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};

use super::error::{Error, Result};
use super::pdu::{
    AttributeOrdering, ErrorResponse, ParseStatus, Request, Response,
    ServiceSearchAttributeRequest, ServiceSearchAttributeResponse,
};
use super::serialization::{PduHeader, PduId, TransactionId};
use super::{AttributeId, AttributeMap};
use crate::communication::{Channel, Uuid};

/// How long a peer has to answer each request, continuations included.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub transaction_timeout: Duration,
    pub attribute_ordering: AttributeOrdering,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            attribute_ordering: AttributeOrdering::default(),
        }
    }
}

type SearchKey = u64;

enum Command {
    Search {
        key: SearchKey,
        request: ServiceSearchAttributeRequest,
        results: UnboundedSender<Result<AttributeMap>>,
    },
    Cancel(SearchKey),
    PendingTransactions(oneshot::Sender<usize>),
}

/// An SDP client bound to one channel.
///
/// Searches are queued and sent one at a time; a request is only put on the
/// channel once the previous one has completed, failed or timed out.
/// Dropping the client cancels everything still queued.
pub struct Client {
    commands: UnboundedSender<Command>,
    next_key: AtomicU64,
    _alive: oneshot::Sender<()>,
}

impl Client {
    /// Starts a client on `channel` with default options. Must be called from
    /// within a Tokio runtime.
    pub fn new(channel: Channel) -> Self {
        Self::with_options(channel, ClientOptions::default())
    }

    pub fn with_options(channel: Channel, options: ClientOptions) -> Self {
        let (commands_tx, commands_rx) = unbounded_channel();
        let (alive_tx, alive_rx) = oneshot::channel();

        let engine = Engine {
            channel,
            commands: commands_rx,
            client_gone: alive_rx,
            options,
            queue: VecDeque::new(),
            in_flight: false,
            deadline: None,
            next_tid: 0,
            connected: true,
        };
        tokio::spawn(engine.run());

        Self {
            commands: commands_tx,
            next_key: AtomicU64::new(0),
            _alive: alive_tx,
        }
    }

    /// Searches the peer for records matching every UUID in `pattern` and
    /// streams the requested attributes of each. An empty `attributes` asks
    /// for all of them.
    pub fn service_search_attributes<P, A>(&self, pattern: P, attributes: A) -> SearchResults
    where
        P: IntoIterator<Item = Uuid>,
        A: IntoIterator<Item = AttributeId>,
    {
        let mut request = ServiceSearchAttributeRequest::new();
        request.set_search_pattern(pattern);
        for id in attributes {
            request.add_attribute(id);
        }
        if request.attribute_ranges().is_empty() {
            request.add_attribute_range(AttributeId(0x0000), AttributeId(0xFFFF));
        }

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (results_tx, results_rx) = unbounded_channel();
        let results = SearchResults {
            key,
            results: results_rx,
            commands: self.commands.clone(),
            finished: false,
        };

        if !request.valid() {
            debug!("refusing to send an invalid search");
            let _ = results_tx.send(Err(Error::InvalidParameters));
            return results;
        }

        let command = Command::Search {
            key,
            request,
            results: results_tx,
        };
        if let Err(SendError(Command::Search { results, .. })) = self.commands.send(command) {
            let _ = results.send(Err(Error::Canceled));
        }

        results
    }

    /// Number of searches queued or in flight.
    pub async fn pending_transactions(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::PendingTransactions(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The attribute lists found by one search, one item per matching record.
///
/// The stream ends after the last list, or after a single error. Dropping it
/// early cancels the search.
pub struct SearchResults {
    key: SearchKey,
    results: UnboundedReceiver<Result<AttributeMap>>,
    commands: UnboundedSender<Command>,
    finished: bool,
}

impl SearchResults {
    /// Cancels the search. If it has not finished yet, the stream yields
    /// [`Error::Canceled`] and ends.
    pub fn cancel(&self) {
        if !self.finished {
            let _ = self.commands.send(Command::Cancel(self.key));
        }
    }
}

impl Stream for SearchResults {
    type Item = Result<AttributeMap>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(self.results.poll_recv(cx));
        if item.is_none() {
            self.finished = true;
        }
        Poll::Ready(item)
    }
}

impl Drop for SearchResults {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Transaction {
    tid: TransactionId,
    key: SearchKey,
    request: ServiceSearchAttributeRequest,
    response: ServiceSearchAttributeResponse,
    results: UnboundedSender<Result<AttributeMap>>,
}

impl Transaction {
    fn fail(self, error: Error) {
        debug!("transaction {:#06x} failed: {}", self.tid, error);
        let _ = self.results.send(Err(error));
    }
}

enum Event {
    Command(Option<Command>),
    ClientDropped,
    Received(Option<Bytes>),
    TimedOut,
}

/// Owns the channel and every transaction. When `in_flight` is set, the
/// front of `queue` is the transaction awaiting a response.
struct Engine {
    channel: Channel,
    commands: UnboundedReceiver<Command>,
    client_gone: oneshot::Receiver<()>,
    options: ClientOptions,
    queue: VecDeque<Transaction>,
    in_flight: bool,
    deadline: Option<Instant>,
    next_tid: TransactionId,
    connected: bool,
}

impl Engine {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline.unwrap_or_else(Instant::now);
            let event = tokio::select! {
                biased;
                command = self.commands.recv() => Event::Command(command),
                _ = &mut self.client_gone => Event::ClientDropped,
                sdu = self.channel.recv(), if self.connected => Event::Received(sdu),
                _ = sleep_until(deadline), if self.deadline.is_some() => Event::TimedOut,
            };

            match event {
                Event::Command(None) | Event::ClientDropped => {
                    self.shut_down();
                    break;
                }
                Event::Command(Some(Command::Search { key, request, results })) => {
                    self.enqueue(key, request, results)
                }
                Event::Command(Some(Command::PendingTransactions(reply))) => {
                    let _ = reply.send(self.queue.len());
                }
                Event::Command(Some(Command::Cancel(key))) => self.cancel(key),
                Event::Received(Some(sdu)) => self.handle_sdu(&sdu),
                Event::Received(None) => {
                    info!("sdp channel closed");
                    self.connected = false;
                    self.cancel_all(Error::LinkDisconnected);
                }
                Event::TimedOut => self.time_out(),
            }

            self.advance();
        }
        trace!("sdp client stopped");
    }

    fn allocate_tid(&mut self) -> Option<TransactionId> {
        for _ in 0..=TransactionId::MAX as usize {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);
            if !self.queue.iter().any(|t| t.tid == tid) {
                return Some(tid);
            }
        }
        None
    }

    fn enqueue(
        &mut self,
        key: SearchKey,
        request: ServiceSearchAttributeRequest,
        results: UnboundedSender<Result<AttributeMap>>,
    ) {
        if !self.connected {
            let _ = results.send(Err(Error::LinkDisconnected));
            return;
        }

        let tid = match self.allocate_tid() {
            Some(tid) => tid,
            None => {
                warn!("every transaction id is in use");
                let _ = results.send(Err(Error::TransactionIdsExhausted));
                return;
            }
        };

        trace!("queueing transaction {:#06x}", tid);
        self.queue.push_back(Transaction {
            tid,
            key,
            request,
            response: ServiceSearchAttributeResponse::with_ordering(
                self.options.attribute_ordering,
            ),
            results,
        });
    }

    /// Puts the front transaction on the channel if nothing is in flight.
    fn advance(&mut self) {
        while !self.in_flight {
            let transaction = match self.queue.front() {
                Some(transaction) => transaction,
                None => {
                    self.deadline = None;
                    return;
                }
            };

            let tid = transaction.tid;
            let pdu = match transaction.request.get_pdu(tid) {
                Some(pdu) => pdu,
                None => {
                    if let Some(transaction) = self.queue.pop_front() {
                        transaction.fail(Error::InvalidParameters);
                    }
                    continue;
                }
            };

            if self.channel.send(pdu) {
                trace!("sent transaction {:#06x}", tid);
                self.in_flight = true;
                self.deadline = Some(Instant::now() + self.options.transaction_timeout);
            } else {
                warn!("couldn't send sdp request, treating the channel as closed");
                self.connected = false;
                self.cancel_all(Error::LinkDisconnected);
            }
        }
    }

    fn take_in_flight(&mut self) -> Option<Transaction> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        self.deadline = None;
        self.queue.pop_front()
    }

    fn cancel(&mut self, key: SearchKey) {
        let idx = match self.queue.iter().position(|t| t.key == key) {
            Some(idx) => idx,
            None => return,
        };
        if idx == 0 && self.in_flight {
            self.in_flight = false;
            self.deadline = None;
        }
        if let Some(transaction) = self.queue.remove(idx) {
            transaction.fail(Error::Canceled);
        }
    }

    fn cancel_all(&mut self, error: Error) {
        self.in_flight = false;
        self.deadline = None;
        for transaction in self.queue.drain(..) {
            transaction.fail(error.clone());
        }
    }

    /// Cancels every search, including those not yet taken off the command
    /// queue.
    fn shut_down(&mut self) {
        self.cancel_all(Error::Canceled);
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Search { results, .. } = command {
                let _ = results.send(Err(Error::Canceled));
            }
        }
    }

    fn time_out(&mut self) {
        if let Some(transaction) = self.take_in_flight() {
            warn!("transaction {:#06x} timed out", transaction.tid);
            transaction.fail(Error::TimedOut);
        }
    }

    fn handle_sdu(&mut self, sdu: &[u8]) {
        let mut params = sdu;
        let header = match PduHeader::from_buf(&mut params) {
            Some(header) => header,
            None => {
                debug!("dropping {} byte sdu with no header", sdu.len());
                return;
            }
        };

        let expected = self.queue.front().filter(|_| self.in_flight).map(|t| t.tid);
        if expected != Some(header.tid) {
            debug!("dropping response to unknown transaction {:#06x}", header.tid);
            return;
        }
        let mut transaction = match self.take_in_flight() {
            Some(transaction) => transaction,
            None => return,
        };

        if header.parameter_length as usize != params.len() {
            transaction.fail(Error::PacketMalformed);
            return;
        }

        match header.pdu_id() {
            Some(PduId::ErrorResponse) => {
                let mut response = ErrorResponse::default();
                let error = match response.parse(params).map(|_| response.error_code()) {
                    Ok(Some(code)) => Error::Remote(code),
                    Ok(None) => Error::PacketMalformed,
                    Err(error) => error,
                };
                transaction.fail(error);
            }
            Some(PduId::ServiceSearchAttributeResponse) => {
                match transaction.response.parse(params) {
                    Ok(ParseStatus::Complete) => {
                        trace!("transaction {:#06x} complete", transaction.tid);
                        for attributes in transaction.response.into_attribute_lists() {
                            if transaction.results.send(Ok(attributes)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(ParseStatus::Continuing) => {
                        let state = transaction.response.continuation_state().to_vec();
                        if !transaction.request.set_continuation_state(&state) {
                            transaction.fail(Error::PacketMalformed);
                            return;
                        }
                        self.queue.push_front(transaction);
                    }
                    Err(error) => transaction.fail(error),
                }
            }
            other => {
                debug!("unexpected {:?} in response to a search", other);
                transaction.fail(Error::PacketMalformed);
            }
        }
    }
}
