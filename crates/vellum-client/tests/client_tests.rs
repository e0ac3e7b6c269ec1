// ABOUTME: End-to-end client tests against an in-process tonic server.
// ABOUTME: Exercises auth headers, item calls, list paging, sync, and transactions.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use prost::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{TcpListenerStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status, Streaming};
use vellum_client::proto::server::{
    AuthService, AuthServiceServer, DatabaseService, DatabaseServiceServer,
};
use vellum_client::proto::transaction_request::Command;
use vellum_client::proto::transaction_response::Result as Payload;
use vellum_client::proto::{self, list_response, sync_list_response};
use vellum_client::{
    Client, ClientConfig, Error, ErrorKind, GeneratedId, ListOptions, PutOptions, RawSchema,
    TransactionPhase,
};

type ServerStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

const TOKEN: &str = "tok-1";
const PAGE_SIZE: usize = 2;

fn check_auth<T>(request: &Request<T>) -> Result<(), Status> {
    let expected = format!("Bearer {TOKEN}");
    match request.metadata().get("authorization") {
        Some(value) if value.to_str().ok() == Some(expected.as_str()) => Ok(()),
        _ => Err(Status::unauthenticated("missing or invalid bearer token")),
    }
}

fn key_of(item: &proto::Item) -> String {
    String::from_utf8_lossy(&item.payload).into_owned()
}

#[derive(Default)]
struct FakeAuth {
    issued: Arc<AtomicU32>,
}

#[tonic::async_trait]
impl AuthService for FakeAuth {
    async fn get_auth_token(
        &self,
        request: Request<proto::GetAuthTokenRequest>,
    ) -> Result<Response<proto::GetAuthTokenResponse>, Status> {
        let req = request.into_inner();
        if req.client_id != "id" || req.client_secret != "secret" {
            return Err(Status::unauthenticated("bad client credentials"));
        }
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(proto::GetAuthTokenResponse {
            auth_token: TOKEN.to_string(),
            expires_in_s: 3600,
        }))
    }
}

type Store = Arc<Mutex<BTreeMap<String, proto::Item>>>;

#[derive(Default)]
struct FakeDatabase {
    items: Store,
    next_generated: Arc<AtomicU64>,
    begins: Arc<Mutex<Vec<proto::TransactionBegin>>>,
}

impl FakeDatabase {
    /// Pages of `PAGE_SIZE` items followed by a finished token.
    fn list_pages(
        &self,
        keys: impl Fn(&str) -> bool,
        limit: u32,
    ) -> Vec<Result<proto::ListResponse, Status>> {
        let items = self.items.lock().unwrap();
        let matching: Vec<_> = items
            .iter()
            .filter(|(k, _)| keys(k.as_str()))
            .map(|(_, v)| v.clone())
            .collect();
        let take = if limit == 0 {
            matching.len()
        } else {
            (limit as usize).min(matching.len())
        };
        let can_continue = take < matching.len();
        let page = &matching[..take];

        let mut responses: Vec<_> = page
            .chunks(PAGE_SIZE)
            .map(|chunk| {
                Ok(proto::ListResponse {
                    response: Some(list_response::Response::Result(proto::ListPartialResult {
                        items: chunk.to_vec(),
                    })),
                })
            })
            .collect();
        let last = page.last().map(key_of).unwrap_or_default();
        responses.push(Ok(proto::ListResponse {
            response: Some(list_response::Response::Finished(proto::ListFinished {
                token: Some(proto::ListToken {
                    token_data: last.into_bytes(),
                    can_continue,
                    can_sync: true,
                    schema_version_id: 3,
                }),
            })),
        }));
        responses
    }
}

fn conditional_check_failed() -> Status {
    let details = proto::ErrorDetails {
        code: "ConditionalCheckFailed".to_string(),
        message: "item already exists".to_string(),
        upstream_cause: String::new(),
    };
    Status::with_details(
        Code::FailedPrecondition,
        "precondition failed",
        details.encode_to_vec().into(),
    )
}

#[tonic::async_trait]
impl DatabaseService for FakeDatabase {
    async fn get(
        &self,
        request: Request<proto::GetRequest>,
    ) -> Result<Response<proto::GetResponse>, Status> {
        check_auth(&request)?;
        let req = request.into_inner();
        let items = self.items.lock().unwrap();
        Ok(Response::new(proto::GetResponse {
            items: req
                .key_paths
                .iter()
                .filter_map(|k| items.get(k).cloned())
                .collect(),
        }))
    }

    async fn put(
        &self,
        request: Request<proto::PutRequest>,
    ) -> Result<Response<proto::PutResponse>, Status> {
        check_auth(&request)?;
        let req = request.into_inner();
        let mut items = self.items.lock().unwrap();
        let mut stored = Vec::new();
        for put in req.puts {
            let item = put
                .item
                .ok_or_else(|| Status::invalid_argument("put without item"))?;
            let key = key_of(&item);
            if put.must_not_exist && items.contains_key(&key) {
                return Err(conditional_check_failed());
            }
            items.insert(key, item.clone());
            stored.push(item);
        }
        Ok(Response::new(proto::PutResponse { items: stored }))
    }

    async fn delete(
        &self,
        request: Request<proto::DeleteRequest>,
    ) -> Result<Response<proto::DeleteResponse>, Status> {
        check_auth(&request)?;
        let req = request.into_inner();
        let mut items = self.items.lock().unwrap();
        let results = req
            .key_paths
            .into_iter()
            .filter(|k| items.remove(k).is_some())
            .map(|key_path| proto::DeleteResult { key_path })
            .collect();
        Ok(Response::new(proto::DeleteResponse { results }))
    }

    type BeginListStream = ServerStream<proto::ListResponse>;

    async fn begin_list(
        &self,
        request: Request<proto::BeginListRequest>,
    ) -> Result<Response<Self::BeginListStream>, Status> {
        check_auth(&request)?;
        let req = request.into_inner();
        let prefix = req.key_path_prefix;
        let pages = self.list_pages(|k| k.starts_with(&prefix), req.limit);
        Ok(Response::new(Box::pin(tokio_stream::iter(pages))))
    }

    type ContinueListStream = ServerStream<proto::ListResponse>;

    async fn continue_list(
        &self,
        request: Request<proto::ContinueListRequest>,
    ) -> Result<Response<Self::ContinueListStream>, Status> {
        check_auth(&request)?;
        let after = String::from_utf8_lossy(&request.get_ref().token_data).into_owned();
        let pages = self.list_pages(|k| k > after.as_str(), 0);
        Ok(Response::new(Box::pin(tokio_stream::iter(pages))))
    }

    type SyncListStream = ServerStream<proto::SyncListResponse>;

    async fn sync_list(
        &self,
        request: Request<proto::SyncListRequest>,
    ) -> Result<Response<Self::SyncListStream>, Status> {
        check_auth(&request)?;
        let changed: Vec<_> = self.items.lock().unwrap().values().cloned().collect();
        let responses = vec![
            Ok(proto::SyncListResponse {
                response: Some(sync_list_response::Response::Reset(proto::SyncListReset {})),
            }),
            Ok(proto::SyncListResponse {
                response: Some(sync_list_response::Response::Result(
                    proto::SyncListPartialResponse {
                        changed_items: changed,
                        deleted_items: vec![proto::DeleteResult {
                            key_path: "users/gone".to_string(),
                        }],
                        updated_item_keys_outside_list_window: vec![],
                    },
                )),
            }),
            Ok(proto::SyncListResponse {
                response: Some(sync_list_response::Response::Finished(proto::ListFinished {
                    token: Some(proto::ListToken {
                        token_data: b"synced".to_vec(),
                        can_continue: false,
                        can_sync: true,
                        schema_version_id: 3,
                    }),
                })),
            }),
        ];
        Ok(Response::new(Box::pin(tokio_stream::iter(responses))))
    }

    type TransactionStream = ServerStream<proto::TransactionResponse>;

    async fn transaction(
        &self,
        request: Request<Streaming<proto::TransactionRequest>>,
    ) -> Result<Response<Self::TransactionStream>, Status> {
        check_auth(&request)?;
        let mut inbound = request.into_inner();

        // Like the real service, read the opening message before answering.
        let opening = inbound.message().await?;
        match opening.and_then(|req| req.command) {
            Some(Command::BeginTransaction(begin)) => self.begins.lock().unwrap().push(begin),
            _ => return Err(Status::invalid_argument("stream must open with a begin")),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.items.clone();
        let next_generated = self.next_generated.clone();

        tokio::spawn(async move {
            let mut staged_puts: Vec<proto::Item> = Vec::new();
            let mut staged_deletes: Vec<String> = Vec::new();
            let reply = |message_id, result| {
                let _ = tx.send(proto::TransactionResponse {
                    message_id,
                    result: Some(result),
                });
            };

            while let Ok(Some(req)) = inbound.message().await {
                let id = req.message_id;
                match req.command {
                    Some(Command::GetItems(get)) => {
                        let items = store.lock().unwrap();
                        let found = get
                            .key_paths
                            .iter()
                            .filter_map(|k| items.get(k).cloned())
                            .collect();
                        reply(
                            id,
                            Payload::GetResults(proto::TransactionGetResponse { items: found }),
                        );
                    }
                    Some(Command::PutItems(put)) => {
                        let mut generated_ids = Vec::new();
                        for mut item in put.puts.into_iter().filter_map(|p| p.item) {
                            let key = key_of(&item);
                            let value = if key.contains("{id}") {
                                let n = next_generated.fetch_add(1, Ordering::SeqCst) + 100;
                                item.payload = key.replace("{id}", &n.to_string()).into_bytes();
                                Some(proto::generated_id::Value::Uint(n))
                            } else {
                                None
                            };
                            generated_ids.push(proto::GeneratedId { value });
                            staged_puts.push(item);
                        }
                        reply(id, Payload::PutAck(proto::TransactionPutAck { generated_ids }));
                    }
                    Some(Command::DeleteItems(delete)) => {
                        let results = delete
                            .key_paths
                            .iter()
                            .map(|k| proto::DeleteResult {
                                key_path: k.clone(),
                            })
                            .collect();
                        staged_deletes.extend(delete.key_paths);
                        reply(id, Payload::DeleteAck(proto::TransactionDeleteAck { results }));
                    }
                    Some(Command::Commit(_)) => {
                        let mut items = store.lock().unwrap();
                        for item in &staged_puts {
                            items.insert(key_of(item), item.clone());
                        }
                        for key in &staged_deletes {
                            items.remove(key);
                        }
                        reply(
                            id,
                            Payload::Finished(proto::TransactionFinished {
                                committed: true,
                                put_results: staged_puts.clone(),
                                delete_results: staged_deletes
                                    .iter()
                                    .map(|k| proto::DeleteResult {
                                        key_path: k.clone(),
                                    })
                                    .collect(),
                            }),
                        );
                        break;
                    }
                    Some(Command::Abort(_)) => break,
                    _ => {}
                }
            }
        });

        let outbound = UnboundedReceiverStream::new(rx).map(Ok::<_, Status>);
        Ok(Response::new(Box::pin(outbound)))
    }
}

struct TestServer {
    endpoint: String,
    tokens_issued: Arc<AtomicU32>,
    items: Store,
    begins: Arc<Mutex<Vec<proto::TransactionBegin>>>,
}

/// Route library logs to the test harness; `RUST_LOG=vellum_client=debug` shows traffic.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn serve() -> TestServer {
    init_tracing();
    let auth = FakeAuth::default();
    let tokens_issued = auth.issued.clone();
    let database = FakeDatabase::default();
    let items = database.items.clone();
    let begins = database.begins.clone();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        Server::builder()
            .add_service(DatabaseServiceServer::new(database))
            .add_service(AuthServiceServer::new(auth))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    TestServer {
        endpoint: format!("http://{addr}"),
        tokens_issued,
        items,
        begins,
    }
}

async fn connect(server: &TestServer) -> Client<RawSchema> {
    let config = ClientConfig::new(5)
        .with_endpoint(server.endpoint.clone())
        .with_credentials("id", "secret");
    Client::connect(config, RawSchema::new(3)).await.unwrap()
}

fn item(key: &str) -> proto::Item {
    proto::Item {
        item_type: "user".to_string(),
        payload: key.as_bytes().to_vec(),
    }
}

#[tokio::test]
async fn put_get_delete_round_trip() {
    let server = serve().await;
    let client = connect(&server).await;

    let stored = client.put(&item("users/1")).await.unwrap();
    assert_eq!(key_of(&stored), "users/1");

    let fetched = client.get("users/1").await.unwrap().unwrap();
    assert_eq!(fetched, stored);

    client.delete("users/1").await.unwrap();
    assert!(client.get("users/1").await.unwrap().is_none());

    // One token served every call.
    assert_eq!(server.tokens_issued.load(Ordering::SeqCst), 1);
    client.close().await;
}

#[tokio::test]
async fn batch_calls_skip_missing_items() {
    let server = serve().await;
    let client = connect(&server).await;

    client
        .put_batch(&[item("users/1"), item("users/2")])
        .await
        .unwrap();
    let found = client
        .get_batch(vec!["users/1".into(), "users/9".into(), "users/2".into()])
        .await
        .unwrap();
    assert_eq!(found.len(), 2);

    let deleted = client
        .delete_batch(vec!["users/1".into(), "users/9".into()])
        .await
        .unwrap();
    assert_eq!(deleted, vec!["users/1".to_string()]);
}

#[tokio::test]
async fn bad_credentials_surface_unauthenticated() {
    let server = serve().await;
    let config = ClientConfig::new(5)
        .with_endpoint(server.endpoint.clone())
        .with_credentials("id", "wrong");
    let client = Client::connect(config, RawSchema::new(3)).await.unwrap();

    let err = client.get("users/1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    assert_eq!(server.tokens_issued.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn must_not_exist_conflict_is_classified() {
    let server = serve().await;
    let client = connect(&server).await;

    let options = PutOptions {
        must_not_exist: true,
    };
    client
        .put_with_options(&item("users/1"), options)
        .await
        .unwrap();
    let err = client
        .put_with_options(&item("users/1"), options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConditionalCheckFailed);
    assert!(err.message().contains("already exists"));
}

#[tokio::test]
async fn list_pages_and_continues() {
    let server = serve().await;
    let client = connect(&server).await;
    for n in 1..=5 {
        client.put(&item(&format!("users/{n}"))).await.unwrap();
    }
    client.put(&item("teams/1")).await.unwrap();

    let first = client
        .begin_list("users/", ListOptions::default().with_limit(3))
        .await
        .unwrap();
    let keys: Vec<_> = first.items.iter().map(key_of).collect();
    assert_eq!(keys, vec!["users/1", "users/2", "users/3"]);
    assert!(first.token.can_continue);

    let mut pages = 0;
    let token = client
        .continue_list_with(&first.token, |_page| {
            pages += 1;
            Ok(())
        })
        .await
        .unwrap();
    assert!(pages >= 1);
    assert!(!token.can_continue);

    // A finished token short-circuits.
    let done = client.continue_list(&token).await.unwrap();
    assert!(done.items.is_empty());
    assert_eq!(done.token, token);
}

#[tokio::test]
async fn sync_reports_reset_and_changes() {
    let server = serve().await;
    let client = connect(&server).await;
    client.put(&item("users/1")).await.unwrap();

    let listed = client
        .begin_list("users/", ListOptions::default())
        .await
        .unwrap();
    assert!(listed.token.can_sync);

    let sync = client.sync_list(&listed.token).await.unwrap();
    assert!(sync.reset);
    assert_eq!(sync.changed.len(), 1);
    assert_eq!(sync.deleted, vec!["users/gone".to_string()]);
    assert_eq!(sync.token.token_data, b"synced".to_vec());
}

#[tokio::test]
async fn sync_rejects_unsyncable_token() {
    let server = serve().await;
    let client = connect(&server).await;

    let err = client
        .sync_list(&vellum_client::ListToken::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn transaction_commits_resolved_items() {
    let server = serve().await;
    let client = connect(&server).await;

    let result = client
        .transaction(|t| async move {
            let id = t.put(&item("users/{id}")).await?;
            t.delete("users/none").await?;
            Ok::<_, Error>(id)
        })
        .await
        .unwrap();

    assert!(result.committed);
    assert_eq!(result.value, Some(GeneratedId::Uint(100)));
    assert_eq!(result.puts.len(), 1);
    assert_eq!(key_of(&result.puts[0]), "users/100");
    assert_eq!(result.deletes, vec!["users/none".to_string()]);

    assert!(client.get("users/100").await.unwrap().is_some());
}

#[tokio::test]
async fn begin_transaction_reaches_a_server_that_reads_begin_first() {
    let server = serve().await;
    let client = connect(&server).await;

    let txn = tokio::time::timeout(Duration::from_secs(5), client.begin_transaction())
        .await
        .expect("begin_transaction hung waiting for the stream to open")
        .unwrap();
    assert_eq!(txn.phase(), TransactionPhase::Open);

    {
        let begins = server.begins.lock().unwrap();
        assert_eq!(begins.len(), 1);
        assert_eq!(begins[0].store_id, 5);
        assert_eq!(begins[0].schema_version_id, 3);
    }

    assert!(txn.get("users/none").await.unwrap().is_none());
    let result = txn.commit().await.unwrap();
    assert!(result.committed);
    assert_eq!(txn.phase(), TransactionPhase::Committed);
}

#[tokio::test]
async fn failed_transaction_body_leaves_store_untouched() {
    let server = serve().await;
    let client = connect(&server).await;

    let outcome = client
        .transaction(|t| async move {
            t.put(&item("users/staged")).await?;
            Err::<(), _>(Error::invalid_argument("rejected by caller"))
        })
        .await;

    assert_eq!(outcome.unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert!(!server.items.lock().unwrap().contains_key("users/staged"));
}

#[tokio::test]
async fn connect_without_credentials_fails_before_io() {
    let from_env = [vellum_auth::CLIENT_ID_ENV, vellum_auth::CLIENT_SECRET_ENV]
        .iter()
        .any(|var| std::env::var(var).is_ok());
    if from_env {
        return;
    }
    let config = ClientConfig::new(5).with_endpoint("http://127.0.0.1:1");
    let err = Client::connect(config, RawSchema::new(3)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);
}
