//! Test fixtures: mock cluster backends and ready-made gateways.

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use url::Url;

use crate::Gateway;
use crate::auth::{NoLocalTokens, TokenAuthorization, TokenLookup};
use crate::config::{BackendConfig, GatewayConfig, Listener, RemoteCluster};
use crate::errors::Result;

pub(crate) struct MockBackend {
    port: u16,
}

impl MockBackend {
    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

/// Starts a mock cluster backend that feeds each collected request to
/// `handler` and serves its response.
pub(crate) async fn start_mock_backend<F>(handler: F) -> MockBackend
where
    F: Fn(Request<Bytes>) -> Response<Bytes> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let handler = handler.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body_bytes = body
                            .collect()
                            .await
                            .map(|collected| collected.to_bytes())
                            .unwrap_or_default();
                        let response = handler(Request::from_parts(parts, body_bytes));
                        Ok::<_, Infallible>(response.map(Full::new))
                    }
                });

                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    // Give the server a moment to start
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    MockBackend { port }
}

/// A backend that answers list sub-queries by echoing one item per
/// requested UUID, the way a cluster would for objects it owns.
pub(crate) async fn start_uuid_list_backend() -> MockBackend {
    start_mock_backend(|req| {
        let body = std::str::from_utf8(req.body()).unwrap_or_default();
        let filters_json = url::form_urlencoded::parse(body.as_bytes())
            .find(|(key, _)| key == "filters")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();
        let filters: Vec<Vec<serde_json::Value>> =
            serde_json::from_str(&filters_json).unwrap_or_default();

        let mut items = Vec::new();
        for predicate in &filters {
            if let [_, op, serde_json::Value::Array(uuids)] = predicate.as_slice()
                && op.as_str() == Some("in")
            {
                for uuid in uuids {
                    items.push(serde_json::json!({ "uuid": uuid }));
                }
            }
        }

        let body = serde_json::json!({
            "kind": "arvados#workflowList",
            "items": items,
        });
        Response::new(Bytes::from(serde_json::to_vec(&body).unwrap()))
    })
    .await
}

fn remote(host: &str, insecure: bool) -> RemoteCluster {
    RemoteCluster {
        host: host.to_string(),
        scheme: "http".to_string(),
        insecure,
        proxy: true,
    }
}

fn gateway_config(backend_addr: &str, remotes: HashMap<String, RemoteCluster>) -> GatewayConfig {
    GatewayConfig {
        cluster_id: "zhome".to_string(),
        listener: Listener {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        backend: BackendConfig {
            url: Url::parse(&format!("http://{backend_addr}")).unwrap(),
        },
        remote_clusters: remotes,
    }
}

/// Gateway whose local backend refuses connections; for tests that never
/// reach it.
pub(crate) fn test_gateway(remotes: &[(&str, &str, bool)]) -> Gateway {
    test_gateway_with_backend("127.0.0.1:1", remotes)
}

pub(crate) fn test_gateway_with_backend(
    backend_addr: &str,
    remotes: &[(&str, &str, bool)],
) -> Gateway {
    let remotes = remotes
        .iter()
        .map(|(id, host, insecure)| (id.to_string(), remote(host, *insecure)))
        .collect();
    Gateway::new(
        gateway_config(backend_addr, remotes),
        Arc::new(NoLocalTokens),
    )
    .unwrap()
}

/// Gateway with one UUID-echoing mock cluster per remote ID.
pub(crate) async fn test_gateway_with_remotes(remote_ids: &[&str]) -> Arc<Gateway> {
    let mut remotes = HashMap::new();
    for id in remote_ids {
        let backend = start_uuid_list_backend().await;
        remotes.insert(id.to_string(), remote(&backend.addr(), false));
    }
    Arc::new(Gateway::new(gateway_config("127.0.0.1:1", remotes), Arc::new(NoLocalTokens)).unwrap())
}

pub(crate) async fn test_gateway_with_backend_and_remotes(
    backend_addr: &str,
    remotes: &[(&str, String)],
) -> Arc<Gateway> {
    let remotes = remotes
        .iter()
        .map(|(id, host)| (id.to_string(), remote(host, false)))
        .collect();
    Arc::new(
        Gateway::new(gateway_config(backend_addr, remotes), Arc::new(NoLocalTokens)).unwrap(),
    )
}

/// Backend that records every request it receives and returns an empty JSON
/// object, for asserting on what a remote cluster was sent.
pub(crate) async fn start_recording_backend()
-> (MockBackend, Arc<parking_lot::Mutex<Vec<Request<Bytes>>>>) {
    let recorded = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorded_for_handler = Arc::clone(&recorded);
    let backend = start_mock_backend(move |req| {
        recorded_for_handler.lock().push(req);
        Response::new(Bytes::from_static(b"{}"))
    })
    .await;
    (backend, recorded)
}

/// JSON collection record body with the given manifest and claimed hash.
pub(crate) fn collection_body(manifest: &str, pdh: &str) -> Bytes {
    let body = serde_json::json!({
        "uuid": "zzzzz-4zz18-zzzzzzzzzzzzzzz",
        "manifest_text": manifest,
        "portable_data_hash": pdh,
    });
    Bytes::from(serde_json::to_vec(&body).unwrap())
}

/// Content hash of a manifest after dropping access signatures, the domain
/// the gateway verifies rewritten manifests against.
pub(crate) fn stripped_pdh(manifest: &str) -> String {
    let mut stripped = String::new();
    for line in manifest.split_terminator('\n') {
        for (i, token) in line.split(' ').enumerate() {
            if i > 0 {
                stripped.push(' ');
            }
            let head = token.split('+').next().unwrap_or("");
            let is_locator = head.len() == 32 && head.bytes().all(|b| b.is_ascii_hexdigit());
            if is_locator && token.contains("+A") {
                stripped.push_str(head);
                if let Some(size) = token.split('+').nth(1) {
                    stripped.push('+');
                    stripped.push_str(size);
                }
            } else {
                stripped.push_str(token);
            }
        }
        stripped.push('\n');
    }
    format!("{:x}+{}", md5::compute(stripped.as_bytes()), stripped.len())
}

/// In-memory token store for exercising the legacy-credential path.
pub(crate) struct StaticTokenLookup {
    tokens: HashMap<String, TokenAuthorization>,
}

impl StaticTokenLookup {
    pub fn with_token(token: &str, authorization: TokenAuthorization) -> Self {
        let mut tokens = HashMap::new();
        tokens.insert(token.to_string(), authorization);
        Self { tokens }
    }
}

#[async_trait]
impl TokenLookup for StaticTokenLookup {
    async fn validate_api_token(&self, token: &str) -> Result<Option<TokenAuthorization>> {
        Ok(self.tokens.get(token).cloned())
    }
}
