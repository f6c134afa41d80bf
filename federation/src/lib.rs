//! Federated API gateway core.
//!
//! The gateway fronts a cluster-local REST backend. Every request is either
//! served locally, proxied to exactly one peer cluster (with a per-remote
//! salted credential), or fanned out across clusters and merged:
//!
//! HTTP request → loop detection → dispatch → (local backend | single
//! remote, optionally with signature rewriting | multi-cluster query engine |
//! content-hash federation search) → client.

pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod filter;
pub mod manifest;
mod multi_query;
mod pdh_search;
mod proxy;
mod routes;
pub mod salt;

#[cfg(test)]
mod testutils;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response};
use std::pin::Pin;
use std::sync::Arc;

use crate::auth::TokenLookup;
use crate::client::ClientPair;
use crate::config::GatewayConfig;
use crate::errors::{FederationError, Result};
use crate::manifest::SignatureRewriter;
use crate::routes::{COLLECTION_ROUTE, FORM_URLENCODED, Params, ResourceRoute, RouteTarget};

/// Bound on outstanding sub-requests during federation fan-out. The bound is
/// per request, not global.
pub(crate) const FANOUT_PARALLELISM: usize = 4;

pub struct Gateway {
    pub(crate) config: GatewayConfig,
    pub(crate) clients: ClientPair,
    pub(crate) token_lookup: Arc<dyn TokenLookup>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        token_lookup: Arc<dyn TokenLookup>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            config,
            clients: ClientPair::new()?,
            token_lookup,
        })
    }

    async fn forward_local(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        match self.local_request(req, filter::passthrough).await? {
            Some(resp) => Ok(resp),
            None => Err(FederationError::InternalError(
                "local response unexpectedly suppressed".to_string(),
            )),
        }
    }
}

/// Routes one collected request to wherever it belongs.
pub(crate) async fn dispatch(
    gateway: &Arc<Gateway>,
    req: Request<Bytes>,
) -> Result<Response<Bytes>> {
    if auth::bypass_federation(req.headers()) {
        // The credential is already salted, or the request came from another
        // gateway instance. Proxying again would loop.
        return gateway.forward_local(req).await;
    }

    match routes::classify(req.uri().path()) {
        RouteTarget::CollectionsIndex | RouteTarget::Passthrough => {
            gateway.forward_local(req).await
        }
        RouteTarget::Collection => dispatch_collection(gateway, req).await,
        RouteTarget::Generic(route) => dispatch_generic(gateway, route, req).await,
    }
}

/// Requests under `/arvados/v1/collections/`: by content hash the whole
/// federation is searched; by UUID a remote cluster's record has its block
/// signatures rewritten on the way through.
async fn dispatch_collection(
    gateway: &Arc<Gateway>,
    req: Request<Bytes>,
) -> Result<Response<Bytes>> {
    if req.method() != Method::GET {
        return gateway.forward_local(req).await;
    }

    if let Some(pdh) = routes::pdh_from_path(req.uri().path()).map(str::to_string) {
        return pdh_search::search_federation_for_pdh(gateway, req, &pdh).await;
    }

    let cluster_id = COLLECTION_ROUTE
        .cluster_from_path(req.uri().path())
        .map(str::to_string);
    match cluster_id {
        Some(cluster_id) if cluster_id != gateway.config.cluster_id => {
            let rewriter = SignatureRewriter::new(cluster_id.clone(), None);
            match gateway
                .remote_cluster_request(&cluster_id, req, rewriter.into_filter())
                .await?
            {
                Some(resp) => Ok(resp),
                None => Err(FederationError::InternalError(
                    "remote response unexpectedly suppressed".to_string(),
                )),
            }
        }
        _ => gateway.forward_local(req).await,
    }
}

/// Dispatch for the generic resource kinds (workflows, containers,
/// container requests).
async fn dispatch_generic(
    gateway: &Arc<Gateway>,
    route: &ResourceRoute,
    req: Request<Bytes>,
) -> Result<Response<Bytes>> {
    let mut cluster_id = route
        .cluster_from_path(req.uri().path())
        .map(str::to_string);

    let mut params = Params::from_query(req.uri().query().unwrap_or_default());
    if req.method() == Method::POST && routes::content_type(req.headers()) == FORM_URLENCODED {
        // The body stays with the request for downstream forwarding.
        params.merge_form_body(req.body());
    }

    // An explicit cluster_id parameter beats the URL segment.
    if let Some(explicit) = params.single("cluster_id") {
        cluster_id = Some(explicit.to_string());
    }
    let cluster_id = cluster_id.unwrap_or_default();

    let effective_method = routes::effective_method(req.method(), &params);

    if effective_method == "GET"
        && cluster_id.is_empty()
        && params.values("filters").len() == 1
        && let Some(resp) = multi_query::handle_multi_cluster_query(gateway, &req, &params).await
    {
        return Ok(resp);
    }

    if cluster_id.is_empty() || cluster_id == gateway.config.cluster_id {
        gateway.forward_local(req).await
    } else {
        match gateway
            .remote_cluster_request(&cluster_id, req, filter::passthrough)
            .await?
        {
            Some(resp) => Ok(resp),
            None => Err(FederationError::InternalError(
                "remote response unexpectedly suppressed".to_string(),
            )),
        }
    }
}

pub struct FederationService {
    gateway: Arc<Gateway>,
}

impl FederationService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

impl Service<Request<Incoming>> for FederationService {
    type Response = Response<Full<Bytes>>;
    type Error = FederationError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let gateway = self.gateway.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body_bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    let err = FederationError::RequestBodyError(e.to_string());
                    return Ok(err.into_response().map(Full::new));
                }
            };
            let request = Request::from_parts(parts, body_bytes);

            let response = match dispatch(&gateway, request).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::debug!(error = %e, "request failed in gateway");
                    e.into_response()
                }
            };
            Ok(response.map(Full::new))
        })
    }
}

pub async fn run(
    config: GatewayConfig,
    token_lookup: Arc<dyn TokenLookup>,
) -> Result<(), FederationError> {
    let listener = config.listener.clone();
    let gateway = Arc::new(Gateway::new(config, token_lookup)?);

    tracing::info!(
        cluster_id = %gateway.config.cluster_id,
        remotes = gateway.config.remote_clusters.len(),
        "starting federation gateway"
    );

    shared::http::run_http_service(
        &listener.host,
        listener.port,
        FederationService::new(gateway),
    )
    .await
}
