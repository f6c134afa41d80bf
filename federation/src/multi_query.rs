//! Multi-cluster UUID list queries.
//!
//! A list request whose `filters` select objects purely by UUID may name
//! objects living on several clusters. The engine partitions the UUIDs by
//! their five-character cluster prefix, issues one synthesized sub-query per
//! cluster (bounded parallelism), and concatenates the result lists.
//!
//! Cross-cluster ordering and counting have no coherent semantics, which is
//! why callers must send `count=none` and must not send `limit`, `offset` or
//! `order`.

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use url::form_urlencoded;

use crate::errors::FederationError;
use crate::filter::FilterOutcome;
use crate::routes::{FORM_URLENCODED, Params};
use crate::{FANOUT_PARALLELISM, Gateway};

/// Accumulates sub-query outcomes across workers.
#[derive(Default)]
struct ResponseCollector {
    responses: Vec<JsonValue>,
    errors: Vec<String>,
    kind: Option<String>,
}

impl ResponseCollector {
    /// Records one cluster's outcome under the lock. Successful responses
    /// contribute their `items`; everything else contributes an error.
    fn collect(&mut self, status: StatusCode, body: &Bytes) {
        match serde_json::from_slice::<serde_json::Map<String, JsonValue>>(body) {
            Ok(decoded) => {
                if status != StatusCode::OK {
                    self.errors.push(format!(
                        "error {}",
                        decoded.get("errors").cloned().unwrap_or(JsonValue::Null)
                    ));
                } else if let Some(JsonValue::Array(items)) = decoded.get("items") {
                    self.responses.extend(items.iter().cloned());
                    if self.kind.is_none()
                        && let Some(JsonValue::String(kind)) = decoded.get("kind")
                    {
                        self.kind = Some(kind.clone());
                    }
                } else {
                    self.errors
                        .push("response items missing or malformed".to_string());
                }
            }
            Err(e) => self.errors.push(e.to_string()),
        }
    }
}

/// UUID buckets keyed by owning cluster, or `None` when the filter shape is
/// not a pure by-UUID query the engine can partition.
fn partition_by_cluster(filters: &[Vec<JsonValue>]) -> Option<BTreeMap<String, Vec<String>>> {
    let mut clusters: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let mut bucket = |uuid: &str| -> Option<()> {
        // The first five characters are authoritative for ownership.
        let prefix = uuid.get(..5)?;
        clusters
            .entry(prefix.to_string())
            .or_default()
            .push(uuid.to_string());
        Some(())
    };

    for predicate in filters {
        if predicate.len() != 3 {
            return None;
        }
        if predicate[0].as_str() != Some("uuid") {
            return None;
        }
        match predicate[1].as_str()? {
            "in" => {
                if let JsonValue::Array(uuids) = &predicate[2] {
                    for uuid in uuids {
                        bucket(uuid.as_str()?)?;
                    }
                }
            }
            "=" => {
                if let Some(uuid) = predicate[2].as_str() {
                    bucket(uuid)?;
                }
            }
            _ => return None,
        }
    }

    Some(clusters)
}

/// Attempts to answer a list request as a federated multi-object query.
///
/// Returns `None` when the query is not one the engine handles (the router
/// then falls back to the local/single-remote path), `Some` with the final
/// response otherwise, including precondition failures.
pub(crate) async fn handle_multi_cluster_query(
    gateway: &Arc<Gateway>,
    req: &Request<Bytes>,
    params: &Params,
) -> Option<Response<Bytes>> {
    let filters: Vec<Vec<JsonValue>> =
        match serde_json::from_str(params.values("filters").first()?) {
            Ok(filters) => filters,
            Err(e) => {
                return Some(shared::http::error_response(
                    StatusCode::BAD_REQUEST,
                    &e.to_string(),
                ));
            }
        };

    let clusters = partition_by_cluster(&filters)?;
    if clusters.len() <= 1 {
        // Not a query spanning multiple clusters.
        return None;
    }

    let count = params.single("count");
    if count != Some("none") && count != Some("\"none\"") {
        return Some(shared::http::error_response(
            StatusCode::BAD_REQUEST,
            "Federated multi-object query must have 'count=none'",
        ));
    }
    if params.contains("limit") || params.contains("offset") || params.contains("order") {
        return Some(shared::http::error_response(
            StatusCode::BAD_REQUEST,
            "Federated multi-object may not provide 'limit', 'offset' or 'order'.",
        ));
    }

    let collector = Arc::new(Mutex::new(ResponseCollector::default()));
    let semaphore = Arc::new(Semaphore::new(FANOUT_PARALLELISM));
    let mut workers = JoinSet::new();

    for (cluster_id, uuids) in clusters {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("fan-out semaphore never closes");
        let gateway = Arc::clone(gateway);
        let collector = Arc::clone(&collector);
        let sub_req = build_sub_query(req, &uuids, params.values("select"));

        workers.spawn(async move {
            let _permit = permit;

            let collect = {
                let collector = Arc::clone(&collector);
                move |result: Result<Response<Bytes>, FederationError>| {
                    let mut collector = collector.lock();
                    match result {
                        Ok(resp) => collector.collect(resp.status(), resp.body()),
                        Err(e) => collector.errors.push(e.to_string()),
                    }
                    Ok(FilterOutcome::Suppress)
                }
            };

            let outcome = if cluster_id == gateway.config.cluster_id {
                gateway.local_request(sub_req, collect).await
            } else {
                gateway
                    .remote_cluster_request(&cluster_id, sub_req, collect)
                    .await
            };

            // Failures before the exchange (unknown remote, salt errors)
            // never reach the filter; collect them here.
            if let Err(e) = outcome {
                collector.lock().errors.push(e.to_string());
            }
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "federated query worker panicked");
        }
    }

    let collector = std::mem::take(&mut *collector.lock());
    if !collector.errors.is_empty() {
        return Some(shared::http::errors_response(
            StatusCode::BAD_GATEWAY,
            &collector.errors,
        ));
    }

    let merged = serde_json::json!({
        "kind": collector.kind.unwrap_or_default(),
        "items": collector.responses,
    });
    let mut response = Response::new(Bytes::from(
        serde_json::to_vec(&merged).expect("merged item list serializes"),
    ));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Some(response)
}

/// Synthesizes the POST-as-GET sub-query for one cluster's UUID bucket.
fn build_sub_query(req: &Request<Bytes>, uuids: &[String], select: &[String]) -> Request<Bytes> {
    let uuid_list = serde_json::to_string(uuids).expect("uuid list serializes");

    let mut body = form_urlencoded::Serializer::new(String::new());
    body.append_pair("_method", "GET");
    body.append_pair("count", "none");
    body.append_pair("filters", &format!(r#"[["uuid", "in", {uuid_list}]]"#));
    for selected in select {
        body.append_pair("select", selected);
    }
    let encoded = body.finish();

    let mut sub_req = Request::builder()
        .method("POST")
        .uri(req.uri().path())
        .body(Bytes::from(encoded))
        .expect("rebuilding an existing request cannot fail");
    *sub_req.headers_mut() = req.headers().clone();
    sub_req
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(FORM_URLENCODED));
    let body_len = sub_req.body().len();
    sub_req.headers_mut().insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&body_len.to_string()).expect("length renders as header"),
    );
    sub_req
}
