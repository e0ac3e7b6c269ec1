// ABOUTME: Client facade for item reads, writes, lists, syncs, and transactions.
// ABOUTME: Every call is authorized with the shared token provider's bearer token.

use std::future::Future;
use std::sync::Arc;

use tonic::transport::Channel;
use tonic::Streaming;
use tracing::{debug, info};
use vellum_auth::{Authorizer, GrpcTokenFetcher, TokenProvider};
use vellum_grpc::{create_channel, ChannelConfig, Error, OutboundStream, Result};
use vellum_proto as proto;
use vellum_proto::client::DatabaseServiceClient;
use vellum_proto::{list_response, sync_list_response};

use crate::config::ClientConfig;
use crate::list::{ListOptions, ListResult, ListToken, SyncResult};
use crate::schema::Schema;
use crate::transaction::{Transaction, TransactionResult};

/// Options for a single put.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Fail with `ConditionalCheckFailed` if the item already exists.
    pub must_not_exist: bool,
}

/// Handle to one store. Cheap to clone; clones share the channel and token cache.
pub struct Client<K: Schema> {
    database: DatabaseServiceClient<Channel>,
    authorizer: Authorizer,
    schema: Arc<K>,
    store_id: u64,
    allow_stale: bool,
}

impl<K: Schema> Clone for Client<K> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            authorizer: self.authorizer.clone(),
            schema: Arc::clone(&self.schema),
            store_id: self.store_id,
            allow_stale: self.allow_stale,
        }
    }
}

impl<K: Schema> std::fmt::Debug for Client<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("store_id", &self.store_id)
            .field("allow_stale", &self.allow_stale)
            .finish()
    }
}

impl<K: Schema> Client<K> {
    /// Connect to the configured endpoint and start the token provider.
    ///
    /// # Errors
    /// Fails with `Unauthenticated` before any I/O if no credentials are
    /// configured, or with `Unavailable` if the endpoint cannot be reached.
    pub async fn connect(config: ClientConfig, schema: K) -> Result<Self> {
        let credentials = config.credentials()?;

        let endpoint = config.database_endpoint();
        let channel = create_channel(&ChannelConfig::new(endpoint.as_str())).await?;

        let auth_endpoint = config.auth_service_endpoint();
        let fetcher = if auth_endpoint == endpoint {
            GrpcTokenFetcher::new(channel.clone(), credentials, config.retry.clone())
        } else {
            GrpcTokenFetcher::connect(&auth_endpoint, credentials, config.retry.clone()).await?
        };

        let provider = TokenProvider::with_config(Arc::new(fetcher), config.provider.clone());
        provider.start();

        info!(
            endpoint = %endpoint,
            store_id = config.store_id,
            "Vellum client connected"
        );

        Ok(Self::new(channel, provider, schema, config.store_id).with_allow_stale(config.allow_stale))
    }

    /// Build a client on an existing channel and provider.
    ///
    /// The provider is started if it was not already.
    pub fn new(channel: Channel, provider: TokenProvider, schema: K, store_id: u64) -> Self {
        provider.start();
        Self {
            database: DatabaseServiceClient::new(channel),
            authorizer: Authorizer::new(provider),
            schema: Arc::new(schema),
            store_id,
            allow_stale: false,
        }
    }

    pub fn with_allow_stale(mut self, allow_stale: bool) -> Self {
        self.allow_stale = allow_stale;
        self
    }

    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    pub fn schema(&self) -> &K {
        &self.schema
    }

    pub fn token_provider(&self) -> &TokenProvider {
        self.authorizer.provider()
    }

    fn version(&self) -> u32 {
        self.schema.schema_version_id()
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
        let request = self
            .authorizer
            .request(proto::GetRequest {
                store_id: self.store_id,
                key_paths,
                allow_stale: self.allow_stale,
                schema_version_id: self.version(),
            })
            .await?;
        let response = self.database.clone().get(request).await?.into_inner();
        self.schema.unmarshal_all(response.items)
    }

    /// Store an item, returning it as the server persisted it.
    pub async fn put(&self, item: &K::Item) -> Result<K::Item> {
        self.put_with_options(item, PutOptions::default()).await
    }

    pub async fn put_with_options(&self, item: &K::Item, options: PutOptions) -> Result<K::Item> {
        let puts = vec![proto::PutItem {
            item: Some(self.schema.marshal(item)?),
            must_not_exist: options.must_not_exist,
        }];
        self.put_raw(puts)
            .await?
            .pop()
            .ok_or_else(|| Error::protocol("put returned no item"))
    }

    pub async fn put_batch(&self, items: &[K::Item]) -> Result<Vec<K::Item>> {
        let puts = items
            .iter()
            .map(|item| {
                Ok(proto::PutItem {
                    item: Some(self.schema.marshal(item)?),
                    must_not_exist: false,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.put_raw(puts).await
    }

    async fn put_raw(&self, puts: Vec<proto::PutItem>) -> Result<Vec<K::Item>> {
        let count = puts.len();
        let request = self
            .authorizer
            .request(proto::PutRequest {
                store_id: self.store_id,
                puts,
                schema_version_id: self.version(),
            })
            .await?;
        let response = self.database.clone().put(request).await?.into_inner();
        if response.items.len() != count {
            return Err(Error::protocol(format!(
                "put of {count} items returned {}",
                response.items.len()
            )));
        }
        self.schema.unmarshal_all(response.items)
    }

    pub async fn delete(&self, key_path: impl Into<String>) -> Result<()> {
        self.delete_batch(vec![key_path.into()]).await.map(|_| ())
    }

    /// Delete several items; returns the key paths the server acknowledged.
    pub async fn delete_batch(&self, key_paths: Vec<String>) -> Result<Vec<String>> {
        let request = self
            .authorizer
            .request(proto::DeleteRequest {
                store_id: self.store_id,
                key_paths,
                schema_version_id: self.version(),
            })
            .await?;
        let response = self.database.clone().delete(request).await?.into_inner();
        Ok(response.results.into_iter().map(|r| r.key_path).collect())
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
        let request = self
            .authorizer
            .request(proto::BeginListRequest {
                store_id: self.store_id,
                key_path_prefix: key_path_prefix.into(),
                limit: options.limit,
                allow_stale: options.allow_stale.unwrap_or(self.allow_stale),
                sort_direction: options.sort_direction as i32,
                schema_version_id: self.version(),
            })
            .await?;
        let stream = self.database.clone().begin_list(request).await?.into_inner();
        self.consume_list(stream, consumer).await
    }

    /// Resume a list. A token that cannot continue yields an empty result
    /// without contacting the server.
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
        if !token.can_continue {
            debug!("List token cannot continue, skipping round trip");
            return Ok(token.clone());
        }
        let request = self
            .authorizer
            .request(proto::ContinueListRequest {
                token_data: token.token_data.clone(),
                schema_version_id: self.version(),
            })
            .await?;
        let stream = self
            .database
            .clone()
            .continue_list(request)
            .await?
            .into_inner();
        self.consume_list(stream, consumer).await
    }

    async fn consume_list<F>(
        &self,
        mut stream: Streaming<proto::ListResponse>,
        mut consumer: F,
    ) -> Result<ListToken>
    where
        F: FnMut(Vec<K::Item>) -> Result<()>,
    {
        while let Some(message) = stream.message().await? {
            match message.response {
                Some(list_response::Response::Result(page)) => {
                    consumer(self.schema.unmarshal_all(page.items)?)?;
                }
                Some(list_response::Response::Finished(finished)) => {
                    return ListToken::from_finished(finished);
                }
                None => return Err(Error::protocol("list response carried no payload")),
            }
        }
        Err(Error::stream_closed())
    }

    /// Fetch the changes since `token` was issued.
    ///
    /// # Errors
    /// `InvalidArgument` if the token was not issued as syncable.
    pub async fn sync_list(&self, token: &ListToken) -> Result<SyncResult<K::Item>> {
        if !token.can_sync {
            return Err(Error::invalid_argument("list token does not support sync"));
        }
        let request = self
            .authorizer
            .request(proto::SyncListRequest {
                token_data: token.token_data.clone(),
                schema_version_id: self.version(),
            })
            .await?;
        let mut stream = self.database.clone().sync_list(request).await?.into_inner();

        let mut result = SyncResult::empty();
        while let Some(message) = stream.message().await? {
            match message.response {
                Some(sync_list_response::Response::Reset(_)) => {
                    debug!("Sync token reset, discarding partial results");
                    result = SyncResult::empty();
                    result.reset = true;
                }
                Some(sync_list_response::Response::Result(partial)) => {
                    result
                        .changed
                        .extend(self.schema.unmarshal_all(partial.changed_items)?);
                    result
                        .deleted
                        .extend(partial.deleted_items.into_iter().map(|d| d.key_path));
                    result
                        .updated_outside_window
                        .extend(partial.updated_item_keys_outside_list_window);
                }
                Some(sync_list_response::Response::Finished(finished)) => {
                    result.token = ListToken::from_finished(finished)?;
                    return Ok(result);
                }
                None => return Err(Error::protocol("sync response carried no payload")),
            }
        }
        Err(Error::stream_closed())
    }

    /// Queue the opening message, then open the transaction stream.
    ///
    /// The server may read the opening message before it answers the
    /// streaming call, so it has to be queued first.
    pub async fn begin_transaction(&self) -> Result<Transaction<K>> {
        let outbound = OutboundStream::new();
        let transaction =
            Transaction::detached(Arc::clone(&self.schema), self.store_id, outbound.sender);
        transaction.begin()?;

        let request = self.authorizer.request(outbound.stream).await?;
        let inbound = self.database.clone().transaction(request).await?.into_inner();
        transaction.attach(inbound)?;
        Ok(transaction)
    }

    /// Run `body` in a transaction: commit if it succeeds, abort if it fails.
    ///
    /// Body errors propagate unchanged; transport errors reach the caller
    /// already translated through `From<Error>`.
    pub async fn transaction<F, Fut, R, E>(
        &self,
        body: F,
    ) -> std::result::Result<TransactionResult<K::Item, R>, E>
    where
        F: FnOnce(Transaction<K>) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        E: From<Error>,
    {
        let transaction = self.begin_transaction().await?;
        transaction.run(body).await
    }

    /// Stop token renewal and release the auth transport.
    pub async fn close(&self) {
        self.authorizer.provider().close().await;
    }
}
