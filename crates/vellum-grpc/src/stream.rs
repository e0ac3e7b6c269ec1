// ABOUTME: Typed halves of a bidirectional gRPC stream used by transactions.
// ABOUTME: Outbound is an unbounded FIFO queue; inbound maps statuses onto Error.

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::Error;

/// Push side of an outbound request stream.
///
/// The queue is unbounded and the transport drains it in order, so the
/// server sees requests in the order they were pushed. Pushing never waits.
#[derive(Debug, Clone)]
pub struct StreamSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> StreamSender<T> {
    pub fn new(tx: mpsc::UnboundedSender<T>) -> Self {
        Self { tx }
    }

    /// Queue `msg`. Fails with `Unavailable` once the transport dropped the stream.
    pub fn send(&self, msg: T) -> Result<(), Error> {
        self.tx.send(msg).map_err(|_| Error::stream_closed())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Pull side of an inbound response stream.
///
/// Accepts anything yielding `Result<T, tonic::Status>`, which covers
/// `tonic::Streaming` as well as in-memory streams in tests.
pub struct StreamReceiver<S> {
    inbound: S,
}

impl<S, T> StreamReceiver<S>
where
    S: Stream<Item = Result<T, tonic::Status>> + Unpin,
{
    pub fn new(inbound: S) -> Self {
        Self { inbound }
    }

    /// Next message, or `Ok(None)` after the server half-closes.
    pub async fn recv(&mut self) -> Result<Option<T>, Error> {
        self.inbound
            .next()
            .await
            .transpose()
            .map_err(Error::from)
    }
}

/// An outbound queue paired with the stream handed to a tonic streaming call.
pub struct OutboundStream<T> {
    pub sender: StreamSender<T>,
    /// Pass this as the request body of the streaming RPC.
    pub stream: UnboundedReceiverStream<T>,
}

impl<T> OutboundStream<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: StreamSender::new(tx),
            stream: UnboundedReceiverStream::new(rx),
        }
    }
}

impl<T> Default for OutboundStream<T> {
    fn default() -> Self {
        Self::new()
    }
}
