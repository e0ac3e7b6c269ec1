// ABOUTME: Transaction coordinator over one bidirectional stream.
// ABOUTME: Numbers outbound commands and routes responses back by message id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use vellum_grpc::{Error, ErrorKind, Result, StreamReceiver, StreamSender};
use vellum_proto as proto;
use vellum_proto::transaction_request::Command;
use vellum_proto::transaction_response::Result as Payload;
use vellum_proto::{transaction_list_response, TransactionRequest, TransactionResponse};

use crate::list::{ListOptions, ListResult, ListToken};
use crate::schema::Schema;

/// Message id carried by commit and abort, and by the commit's `finished` reply.
pub const TERMINAL_MESSAGE_ID: u32 = 0;

/// Lifecycle of a transaction. `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Unopened,
    Open,
    Committed,
    Aborted,
}

/// Provisional identifier returned by a put inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratedId {
    Uint(u64),
    Bytes(Vec<u8>),
}

impl GeneratedId {
    /// `None` when the item's key path does not use a generated id.
    fn from_wire(id: proto::GeneratedId) -> Option<Self> {
        match id.value? {
            proto::generated_id::Value::Uint(v) => Some(Self::Uint(v)),
            proto::generated_id::Value::Bytes(b) => Some(Self::Bytes(b)),
        }
    }
}

/// Authoritative outcome reported by the server at commit.
#[derive(Debug, Clone)]
pub struct CommitResult<T> {
    pub committed: bool,
    /// Fully resolved items, one per put, in put order.
    pub puts: Vec<T>,
    /// Key paths of deleted items.
    pub deletes: Vec<String>,
}

/// Value produced by a transaction body together with the commit outcome.
#[derive(Debug, Clone)]
pub struct TransactionResult<T, R> {
    pub value: R,
    pub committed: bool,
    pub puts: Vec<T>,
    pub deletes: Vec<String>,
}

type ResponseSender = mpsc::UnboundedSender<Result<TransactionResponse>>;

/// Waiters keyed by message id. Once the stream fails, `closed` holds the
/// error and every later registration fails with it.
#[derive(Default)]
struct Router {
    waiters: HashMap<u32, ResponseSender>,
    highest_issued: u32,
    closed: Option<Error>,
}

type SharedRouter = Arc<Mutex<Router>>;

fn lock_router(router: &SharedRouter) -> MutexGuard<'_, Router> {
    router.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Router {
    fn register(router: &SharedRouter, message_id: u32) -> Result<PendingResponse> {
        let mut guard = lock_router(router);
        if let Some(err) = &guard.closed {
            return Err(err.clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        guard.waiters.insert(message_id, tx);
        guard.highest_issued = guard.highest_issued.max(message_id);
        Ok(PendingResponse {
            message_id,
            rx,
            router: Arc::clone(router),
        })
    }

    /// Deliver one response. An id that was never issued is fatal.
    fn route(&mut self, response: TransactionResponse) -> Result<()> {
        let id = response.message_id;
        if let Some(waiter) = self.waiters.get(&id) {
            debug!(message_id = id, "Routing transaction response");
            if waiter.send(Ok(response)).is_err() {
                self.waiters.remove(&id);
            }
            return Ok(());
        }
        if id <= self.highest_issued {
            warn!(message_id = id, "Discarding response with no waiter");
            return Ok(());
        }
        Err(Error::protocol(format!(
            "response for message id {id}, which was never issued"
        )))
    }

    fn fail_all(&mut self, err: Error) {
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(err.clone()));
        }
        self.closed = Some(err);
    }
}

/// Responses for one outstanding request. Streaming requests receive several.
struct PendingResponse {
    message_id: u32,
    rx: mpsc::UnboundedReceiver<Result<TransactionResponse>>,
    router: SharedRouter,
}

impl PendingResponse {
    async fn next(&mut self) -> Result<Payload> {
        let response = match self.rx.recv().await {
            Some(response) => response?,
            None => {
                return Err(lock_router(&self.router)
                    .closed
                    .clone()
                    .unwrap_or_else(Error::stream_closed))
            }
        };
        if response.message_id != self.message_id {
            return Err(Error::protocol(format!(
                "expected response to message {}, got {}",
                self.message_id, response.message_id
            )));
        }
        response.result.ok_or_else(|| {
            Error::protocol(format!(
                "response to message {} carried no payload",
                self.message_id
            ))
        })
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        lock_router(&self.router).waiters.remove(&self.message_id);
    }
}

fn payload_name(payload: &Payload) -> &'static str {
    match payload {
        Payload::GetResults(_) => "get_results",
        Payload::PutAck(_) => "put_ack",
        Payload::ListResults(_) => "list_results",
        Payload::DeleteAck(_) => "delete_ack",
        Payload::Finished(_) => "finished",
    }
}

fn unexpected(expected: &str, got: &Payload) -> Error {
    Error::protocol(format!(
        "expected {expected} response, got {}",
        payload_name(got)
    ))
}

async fn read_loop<S>(inbound: S, router: SharedRouter)
where
    S: Stream<Item = std::result::Result<TransactionResponse, tonic::Status>> + Unpin,
{
    let mut receiver = StreamReceiver::new(inbound);
    let err = loop {
        match receiver.recv().await {
            Ok(Some(response)) => {
                let routed = lock_router(&router).route(response);
                if let Err(e) = routed {
                    error!(error = %e, "Transaction stream protocol violation");
                    break e;
                }
            }
            Ok(None) => {
                debug!("Transaction stream closed by server");
                break Error::stream_closed();
            }
            Err(e) => {
                warn!(error = %e, "Transaction stream failed");
                break e;
            }
        }
    };
    lock_router(&router).fail_all(err);
}

struct Inner<K: Schema> {
    schema: Arc<K>,
    store_id: u64,
    outbound: Mutex<Option<StreamSender<TransactionRequest>>>,
    router: SharedRouter,
    next_id: AtomicU32,
    phase: Mutex<TransactionPhase>,
    reader: Mutex<Option<AbortHandle>>,
}

impl<K: Schema> Drop for Inner<K> {
    fn drop(&mut self) {
        let reader = self.reader.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(reader) = reader.take() {
            reader.abort();
        }
    }
}

/// One logical transaction. Clones drive the same transaction.
///
/// Operations are meant to be issued one at a time; responses are still
/// matched by message id, so arrival order does not matter.
pub struct Transaction<K: Schema> {
    inner: Arc<Inner<K>>,
}

impl<K: Schema> Clone for Transaction<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Schema> Transaction<K> {
    /// Attach a coordinator to an established stream and start its read loop.
    ///
    /// Must be called inside a tokio runtime. The transaction starts
    /// `Unopened`; call [`begin`](Self::begin) next.
    pub fn new<S>(
        schema: Arc<K>,
        store_id: u64,
        outbound: StreamSender<TransactionRequest>,
        inbound: S,
    ) -> Self
    where
        S: Stream<Item = std::result::Result<TransactionResponse, tonic::Status>>
            + Send
            + Unpin
            + 'static,
    {
        let transaction = Self::detached(schema, store_id, outbound);
        *transaction.lock_reader() = Some(transaction.spawn_reader(inbound));
        transaction
    }

    /// A coordinator with no inbound half yet.
    ///
    /// Lets the opening message be queued before the streaming call is
    /// made, for servers that read it before sending response headers.
    /// Responses are not routed until [`attach`](Self::attach).
    pub fn detached(
        schema: Arc<K>,
        store_id: u64,
        outbound: StreamSender<TransactionRequest>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                schema,
                store_id,
                outbound: Mutex::new(Some(outbound)),
                router: SharedRouter::default(),
                next_id: AtomicU32::new(1),
                phase: Mutex::new(TransactionPhase::Unopened),
                reader: Mutex::new(None),
            }),
        }
    }

    /// Start routing responses from `inbound`. Fails if a stream is already attached.
    pub fn attach<S>(&self, inbound: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<TransactionResponse, tonic::Status>>
            + Send
            + Unpin
            + 'static,
    {
        let mut reader = self.lock_reader();
        if reader.is_some() {
            return Err(Error::failed_precondition(
                "transaction already has an inbound stream",
            ));
        }
        *reader = Some(self.spawn_reader(inbound));
        Ok(())
    }

    fn spawn_reader<S>(&self, inbound: S) -> AbortHandle
    where
        S: Stream<Item = std::result::Result<TransactionResponse, tonic::Status>>
            + Send
            + Unpin
            + 'static,
    {
        tokio::spawn(read_loop(inbound, Arc::clone(&self.inner.router))).abort_handle()
    }

    fn lock_reader(&self) -> MutexGuard<'_, Option<AbortHandle>> {
        self.inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> TransactionPhase {
        *self.lock_phase()
    }

    fn lock_phase(&self) -> MutexGuard<'_, TransactionPhase> {
        self.inner
            .phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: TransactionPhase) {
        *self.lock_phase() = phase;
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        match self.phase() {
            TransactionPhase::Open => Ok(()),
            phase => Err(Error::failed_precondition(format!(
                "cannot {operation}: transaction is {phase:?}"
            ))),
        }
    }

    fn send(&self, request: TransactionRequest) -> Result<()> {
        let outbound = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(sender) => sender.send(request),
            None => Err(Error::stream_closed()),
        }
    }

    /// Close the outbound half so the server sees end-of-stream.
    fn close_outbound(&self) {
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Assign the next id and enqueue `command` under the outbound lock, so
    /// ids reach the wire in increasing order even across clones.
    /// `register` runs before the send and gets the assigned id.
    fn enqueue<T>(
        &self,
        command: Command,
        register: impl FnOnce(u32) -> Result<T>,
    ) -> Result<T> {
        let outbound = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let sender = outbound.as_ref().ok_or_else(Error::stream_closed)?;
        let message_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let registered = register(message_id)?;
        debug!(message_id, "Sending transaction command");
        sender.send(TransactionRequest {
            message_id,
            command: Some(command),
        })?;
        Ok(registered)
    }

    /// Enqueue a command and return the waiter for its responses.
    fn dispatch(&self, command: Command) -> Result<PendingResponse> {
        self.enqueue(command, |message_id| {
            Router::register(&self.inner.router, message_id)
        })
    }

    /// Send the opening message. Does not wait for an acknowledgement.
    pub fn begin(&self) -> Result<()> {
        {
            let mut phase = self.lock_phase();
            if *phase != TransactionPhase::Unopened {
                return Err(Error::failed_precondition(format!(
                    "cannot begin: transaction is {:?}",
                    *phase
                )));
            }
            *phase = TransactionPhase::Open;
        }

        let begin = Command::BeginTransaction(proto::TransactionBegin {
            store_id: self.inner.store_id,
            schema_version_id: self.inner.schema.schema_version_id(),
        });
        let sent = self.enqueue(begin, |message_id| {
            let mut router = lock_router(&self.inner.router);
            router.highest_issued = router.highest_issued.max(message_id);
            Ok(())
        });
        if let Err(e) = sent {
            self.set_phase(TransactionPhase::Aborted);
            return Err(e);
        }

        info!(store_id = self.inner.store_id, "Transaction opened");
        Ok(())
    }

    /// Read one item; `None` if it does not exist.
    pub async fn get(&self, key_path: impl Into<String>) -> Result<Option<K::Item>> {
        let mut items = self.get_batch(vec![key_path.into()]).await?;
        Ok(if items.is_empty() {
            None
        } else {
            Some(items.swap_remove(0))
        })
    }

    /// Read several items. Missing items are absent from the result.
    pub async fn get_batch(&self, key_paths: Vec<String>) -> Result<Vec<K::Item>> {
        self.ensure_open("get")?;
        let mut pending = self.dispatch(Command::GetItems(proto::TransactionGet { key_paths }))?;
        match pending.next().await? {
            Payload::GetResults(response) => self.inner.schema.unmarshal_all(response.items),
            other => Err(unexpected("get_results", &other)),
        }
    }

    /// Stage a put. Returns only the provisional generated id; the stored item
    /// is reported by [`commit`](Self::commit).
    pub async fn put(&self, item: &K::Item) -> Result<Option<GeneratedId>> {
        let mut ids = self.put_batch(std::slice::from_ref(item)).await?;
        Ok(ids.pop().flatten())
    }

    pub async fn put_batch(&self, items: &[K::Item]) -> Result<Vec<Option<GeneratedId>>> {
        self.ensure_open("put")?;
        let puts = items
            .iter()
            .map(|item| {
                Ok(proto::PutItem {
                    item: Some(self.inner.schema.marshal(item)?),
                    must_not_exist: false,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut pending = self.dispatch(Command::PutItems(proto::TransactionPut { puts }))?;
        match pending.next().await? {
            Payload::PutAck(ack) => {
                if ack.generated_ids.len() != items.len() {
                    return Err(Error::protocol(format!(
                        "put of {} items acknowledged {} ids",
                        items.len(),
                        ack.generated_ids.len()
                    )));
                }
                Ok(ack
                    .generated_ids
                    .into_iter()
                    .map(GeneratedId::from_wire)
                    .collect())
            }
            other => Err(unexpected("put_ack", &other)),
        }
    }

    pub async fn delete(&self, key_path: impl Into<String>) -> Result<()> {
        self.delete_batch(vec![key_path.into()]).await.map(|_| ())
    }

    /// Stage deletes; returns the key paths the server acknowledged.
    pub async fn delete_batch(&self, key_paths: Vec<String>) -> Result<Vec<String>> {
        self.ensure_open("delete")?;
        let mut pending =
            self.dispatch(Command::DeleteItems(proto::TransactionDelete { key_paths }))?;
        match pending.next().await? {
            Payload::DeleteAck(ack) => Ok(ack.results.into_iter().map(|r| r.key_path).collect()),
            other => Err(unexpected("delete_ack", &other)),
        }
    }

    /// List items under a prefix, collecting every page.
    pub async fn begin_list(
        &self,
        key_path_prefix: impl Into<String>,
        options: ListOptions,
    ) -> Result<ListResult<K::Item>> {
        let mut items = Vec::new();
        let token = self
            .begin_list_with(key_path_prefix, options, |page| {
                items.extend(page);
                Ok(())
            })
            .await?;
        Ok(ListResult { items, token })
    }

    /// List items under a prefix, handing each page to `consumer` as it arrives.
    pub async fn begin_list_with<F>(
        &self,
        key_path_prefix: impl Into<String>,
        options: ListOptions,
        consumer: F,
    ) -> Result<ListToken>
    where
        F: FnMut(Vec<K::Item>) -> Result<()>,
    {
        self.ensure_open("list")?;
        let command = Command::BeginList(proto::TransactionBeginList {
            key_path_prefix: key_path_prefix.into(),
            limit: options.limit,
            sort_direction: options.sort_direction as i32,
        });
        self.consume_list(command, consumer).await
    }

    pub async fn continue_list(&self, token: &ListToken) -> Result<ListResult<K::Item>> {
        let mut items = Vec::new();
        let token = self
            .continue_list_with(token, |page| {
                items.extend(page);
                Ok(())
            })
            .await?;
        Ok(ListResult { items, token })
    }

    pub async fn continue_list_with<F>(&self, token: &ListToken, consumer: F) -> Result<ListToken>
    where
        F: FnMut(Vec<K::Item>) -> Result<()>,
    {
        self.ensure_open("continue list")?;
        let command = Command::ContinueList(proto::TransactionContinueList {
            token_data: token.token_data.clone(),
        });
        self.consume_list(command, consumer).await
    }

    async fn consume_list<F>(&self, command: Command, mut consumer: F) -> Result<ListToken>
    where
        F: FnMut(Vec<K::Item>) -> Result<()>,
    {
        let mut pending = self.dispatch(command)?;
        loop {
            let list = match pending.next().await? {
                Payload::ListResults(list) => list,
                other => return Err(unexpected("list_results", &other)),
            };
            match list.response {
                Some(transaction_list_response::Response::Result(page)) => {
                    consumer(self.inner.schema.unmarshal_all(page.items)?)?;
                }
                Some(transaction_list_response::Response::Finished(finished)) => {
                    return ListToken::from_finished(finished);
                }
                None => return Err(Error::protocol("list response carried no payload")),
            }
        }
    }

    /// Commit and wait for the server's authoritative result.
    ///
    /// On failure the transaction is marked `Aborted` locally; no abort is
    /// sent, since the outcome is unknown.
    pub async fn commit(&self) -> Result<CommitResult<K::Item>> {
        self.ensure_open("commit")?;
        let outcome = self.commit_inner().await;
        self.close_outbound();

        match &outcome {
            Ok(result) if result.committed => {
                self.set_phase(TransactionPhase::Committed);
                info!(
                    puts = result.puts.len(),
                    deletes = result.deletes.len(),
                    "Transaction committed"
                );
            }
            Ok(_) => {
                self.set_phase(TransactionPhase::Aborted);
                warn!("Server finished the transaction without committing");
            }
            Err(e) => {
                self.set_phase(TransactionPhase::Aborted);
                warn!(error = %e, "Transaction commit failed");
            }
        }
        outcome
    }

    async fn commit_inner(&self) -> Result<CommitResult<K::Item>> {
        let mut pending = Router::register(&self.inner.router, TERMINAL_MESSAGE_ID)?;
        self.send(TransactionRequest {
            message_id: TERMINAL_MESSAGE_ID,
            command: Some(Command::Commit(proto::TransactionCommit {})),
        })?;

        match pending.next().await? {
            Payload::Finished(finished) => Ok(CommitResult {
                committed: finished.committed,
                puts: self.inner.schema.unmarshal_all(finished.put_results)?,
                deletes: finished
                    .delete_results
                    .into_iter()
                    .map(|r| r.key_path)
                    .collect(),
            }),
            other => Err(unexpected("finished", &other)),
        }
    }

    /// Abort without waiting for the server. The transaction is `Aborted`
    /// afterwards even if the abort marker could not be sent.
    pub fn abort(&self) -> Result<()> {
        self.ensure_open("abort")?;
        self.set_phase(TransactionPhase::Aborted);

        let sent = self.send(TransactionRequest {
            message_id: TERMINAL_MESSAGE_ID,
            command: Some(Command::Abort(proto::TransactionAbort {})),
        });
        self.close_outbound();
        info!("Transaction aborted");
        sent
    }

    /// Run `body` on this (already begun) transaction.
    ///
    /// If the body fails the transaction is aborted and the body's error is
    /// returned. Otherwise it is committed and the commit outcome is returned
    /// with the body's value.
    pub async fn run<F, Fut, R, E>(
        self,
        body: F,
    ) -> std::result::Result<TransactionResult<K::Item, R>, E>
    where
        F: FnOnce(Transaction<K>) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        E: From<Error>,
    {
        match body(self.clone()).await {
            Ok(value) => {
                let result = self.commit().await?;
                Ok(TransactionResult {
                    value,
                    committed: result.committed,
                    puts: result.puts,
                    deletes: result.deletes,
                })
            }
            Err(err) => {
                if self.phase() == TransactionPhase::Open {
                    if let Err(abort_err) = self.abort() {
                        warn!(error = %abort_err, "Failed to abort transaction after body error");
                    }
                }
                Err(err)
            }
        }
    }
}

impl<K: Schema> std::fmt::Debug for Transaction<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("store_id", &self.inner.store_id)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Whether a failed transaction is worth re-running from the start.
pub fn is_conflict(err: &Error) -> bool {
    err.kind() == ErrorKind::ConcurrentModification
}
