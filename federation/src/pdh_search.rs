//! Federation-wide search for a collection addressed by content hash.
//!
//! A collection named by portable data hash may live on any cluster, so the
//! gateway asks its own backend first and, on 404, races the configured
//! remotes. The first response whose manifest re-signs and verifies wins;
//! every other worker is cancelled or suppressed. Exactly one response
//! reaches the client.

use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::filter::{self, FilterOutcome, FilterResult};
use crate::manifest::SignatureRewriter;
use crate::proxy::clone_request;
use crate::{FANOUT_PARALLELISM, Gateway};

/// State shared by every worker in one search. `sent_response` is a monotone
/// latch: once a winner commits, everything else suppresses.
struct SearchState {
    sent_response: bool,
    errors: Vec<String>,
    status_code: StatusCode,
}

/// Per-remote response filter. Runs the signature rewriter outside the lock
/// so one slow manifest cannot block other workers' fast-path suppression.
fn filter_remote_cluster_response(
    state: &Mutex<SearchState>,
    cancel: &CancellationToken,
    remote_id: &str,
    pdh: &str,
    result: Result<Response<Bytes>>,
) -> FilterResult {
    let mut guard = state.lock();

    if guard.sent_response {
        // Another request already returned a response
        return Ok(FilterOutcome::Suppress);
    }

    let resp = match result {
        Err(e) => {
            guard
                .errors
                .push(format!("Request error contacting {remote_id:?}: {e}"));
            guard.status_code = StatusCode::BAD_GATEWAY;
            return Ok(FilterOutcome::Suppress);
        }
        Ok(resp) => resp,
    };

    if resp.status() != StatusCode::OK {
        // Suppress unsuccessful results; another cluster may have it.
        guard
            .errors
            .push(format!("Response from {:?}: {}", remote_id, resp.status()));
        if resp.status() != StatusCode::NOT_FOUND {
            guard.status_code = StatusCode::BAD_GATEWAY;
        }
        return Ok(FilterOutcome::Suppress);
    }

    drop(guard);

    // Decoding and re-signing read the whole body; other workers must not
    // wait on the lock for that.
    let rewritten = SignatureRewriter::new(remote_id, Some(pdh.to_string())).rewrite(resp);

    let mut guard = state.lock();

    if guard.sent_response {
        return Ok(FilterOutcome::Suppress);
    }

    match rewritten {
        Err(e) => {
            guard
                .errors
                .push(format!("Error parsing response from {remote_id:?}: {e}"));
            guard.status_code = StatusCode::BAD_GATEWAY;
            Ok(FilterOutcome::Suppress)
        }
        Ok(resp) => {
            // We have a valid response. Cancel every other worker; theirs
            // will be suppressed.
            guard.sent_response = true;
            cancel.cancel();
            Ok(FilterOutcome::Pass(resp))
        }
    }
}

/// Serves `GET /arvados/v1/collections/<pdh>` by searching the federation.
pub(crate) async fn search_federation_for_pdh(
    gateway: &Arc<Gateway>,
    req: Request<Bytes>,
    pdh: &str,
) -> Result<Response<Bytes>> {
    // The local backend gets first claim; only a 404 starts the search.
    if let Some(resp) = gateway
        .local_request(clone_request(&req), filter::suppress_not_found)
        .await?
    {
        return Ok(resp);
    }

    let state = Arc::new(Mutex::new(SearchState {
        sent_response: false,
        errors: Vec::new(),
        status_code: StatusCode::NOT_FOUND,
    }));
    let cancel = CancellationToken::new();
    let semaphore = Arc::new(Semaphore::new(FANOUT_PARALLELISM));
    let mut workers = JoinSet::new();

    for (remote_id, remote) in &gateway.config.remote_clusters {
        if !remote.proxy {
            continue;
        }
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("fan-out semaphore never closes");
        if state.lock().sent_response {
            break;
        }

        let gateway = Arc::clone(gateway);
        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        let remote_id = remote_id.clone();
        let pdh = pdh.to_string();
        let sub_req = clone_request(&req);

        workers.spawn(async move {
            let _permit = permit;

            let search_filter = {
                let state = Arc::clone(&state);
                let cancel = cancel.clone();
                let remote_id = remote_id.clone();
                move |result| {
                    filter_remote_cluster_response(&state, &cancel, &remote_id, &pdh, result)
                }
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return None,
                outcome = gateway.remote_cluster_request(&remote_id, sub_req, search_filter) => outcome,
            };

            match outcome {
                Ok(won) => won,
                Err(e) => {
                    // Failures before the exchange (salt errors, bad
                    // descriptors) count like transport failures.
                    let mut guard = state.lock();
                    guard.errors.push(e.to_string());
                    guard.status_code = StatusCode::BAD_GATEWAY;
                    None
                }
            }
        });
    }

    // Always drain every worker before answering, so nothing writes after
    // this request completes.
    let mut winner: Option<Response<Bytes>> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Some(resp)) => winner = winner.or(Some(resp)),
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "federation search worker panicked"),
        }
    }

    if let Some(resp) = winner {
        return Ok(resp);
    }

    let state = state.lock();
    Ok(shared::http::errors_response(
        state.status_code,
        &state.errors,
    ))
}
