//! Proxy primitives: forward a prepared request to a peer cluster or to the
//! local backend, then run the outcome through a response filter.
//!
//! `Ok(None)` means the filter suppressed the response; the dispatcher may
//! fall through to another source. Errors surfaced here become gateway error
//! responses at the service boundary.

use hyper::body::Bytes;
use hyper::{Request, Response};

use crate::Gateway;
use crate::client::send_to_upstream;
use crate::errors::{FederationError, Result};
use crate::filter::{FilterOutcome, FilterResult};

impl Gateway {
    /// Forwards `req` to the named peer cluster with a freshly salted
    /// credential, running the result through `filter`.
    pub(crate) async fn remote_cluster_request<F>(
        &self,
        remote_id: &str,
        mut req: Request<Bytes>,
        filter: F,
    ) -> Result<Option<Response<Bytes>>>
    where
        F: FnOnce(Result<Response<Bytes>>) -> FilterResult,
    {
        let Some(remote) = self
            .config
            .remote_clusters
            .get(remote_id)
            .filter(|r| r.proxy)
        else {
            return Err(FederationError::UnknownRemote(remote_id.to_string()));
        };

        self.salt_auth_token(&mut req, remote_id).await?;

        let base_url = remote
            .base_url()
            .map_err(|e| FederationError::InternalError(format!("remote {remote_id}: {e}")))?;
        let client = self.clients.for_remote(remote);

        let result = send_to_upstream(client, &base_url, req).await;
        match filter(result)? {
            FilterOutcome::Pass(resp) => Ok(Some(resp)),
            FilterOutcome::Suppress => Ok(None),
        }
    }

    /// Same contract as [`Gateway::remote_cluster_request`], but targets the
    /// cluster-local backend and leaves the credential untouched.
    pub(crate) async fn local_request<F>(
        &self,
        req: Request<Bytes>,
        filter: F,
    ) -> Result<Option<Response<Bytes>>>
    where
        F: FnOnce(Result<Response<Bytes>>) -> FilterResult,
    {
        let result = send_to_upstream(self.clients.secure(), &self.config.backend.url, req).await;
        match filter(result)? {
            FilterOutcome::Pass(resp) => Ok(Some(resp)),
            FilterOutcome::Suppress => Ok(None),
        }
    }
}

/// Duplicates a collected request so it can be issued to several
/// destinations. Bytes bodies are cheap to share.
pub(crate) fn clone_request(req: &Request<Bytes>) -> Request<Bytes> {
    let mut cloned = Request::builder()
        .method(req.method().clone())
        .uri(req.uri().clone())
        .version(req.version())
        .body(req.body().clone())
        .expect("rebuilding an existing request cannot fail");
    *cloned.headers_mut() = req.headers().clone();
    cloned
}
