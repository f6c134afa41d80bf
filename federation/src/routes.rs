//! URL dispatch tables and request parameter normalization.
//!
//! Every first-class object identifier is `<cluster>-<typecode>-<15 alnum>`;
//! the first five characters name the owning cluster and decide where a
//! request belongs. Each federated resource kind gets a compiled path
//! pattern that captures the cluster segment when the URL addresses a
//! single object.

use http::header::CONTENT_TYPE;
use hyper::{HeaderMap, Method};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use url::form_urlencoded;

pub(crate) const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// A federated resource kind and its compiled path matcher.
pub(crate) struct ResourceRoute {
    pub prefix: &'static str,
    pub type_code: &'static str,
    matcher: Regex,
}

impl ResourceRoute {
    fn new(prefix: &'static str, type_code: &'static str) -> Self {
        let pattern = format!(
            r"^/arvados/v1/{prefix}(/([0-9a-z]{{5}})-{type_code}-[0-9a-z]{{15}})?(.*)$"
        );
        Self {
            prefix,
            type_code,
            matcher: Regex::new(&pattern).expect("resource route pattern compiles"),
        }
    }

    /// Cluster ID from the matched URL segment, when the path addresses a
    /// single object with the right typecode. A wrong typecode yields no
    /// cluster, so the request falls through to the backend.
    pub fn cluster_from_path<'p>(&self, path: &'p str) -> Option<&'p str> {
        self.matcher
            .captures(path)
            .and_then(|m| m.get(2))
            .map(|g| g.as_str())
    }
}

/// Resource kinds handled by the generic dispatch path.
pub(crate) static GENERIC_ROUTES: LazyLock<[ResourceRoute; 3]> = LazyLock::new(|| {
    [
        ResourceRoute::new("workflows", "7fd4e"),
        ResourceRoute::new("containers", "dz642"),
        ResourceRoute::new("container_requests", "xvhdp"),
    ]
});

pub(crate) static COLLECTION_ROUTE: LazyLock<ResourceRoute> =
    LazyLock::new(|| ResourceRoute::new("collections", "4zz18"));

/// Collection addressed by content hash: `<32 hex>+<size>`.
static COLLECTION_BY_PDH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/arvados/v1/collections/([0-9a-fA-F]{32}\+[0-9]+)$")
        .expect("collection PDH pattern compiles")
});

pub(crate) fn pdh_from_path(path: &str) -> Option<&str> {
    COLLECTION_BY_PDH
        .captures(path)
        .and_then(|m| m.get(1))
        .map(|g| g.as_str())
}

/// Where a request path lands before any parameter inspection.
pub(crate) enum RouteTarget {
    /// One of the generic federated resource kinds.
    Generic(&'static ResourceRoute),
    /// `/arvados/v1/collections` exactly: always the local backend.
    CollectionsIndex,
    /// Anything under `/arvados/v1/collections/`.
    Collection,
    /// Everything else: the local backend decides.
    Passthrough,
}

pub(crate) fn classify(path: &str) -> RouteTarget {
    if path == "/arvados/v1/collections" {
        return RouteTarget::CollectionsIndex;
    }
    if path.starts_with("/arvados/v1/collections/") {
        return RouteTarget::Collection;
    }
    for route in GENERIC_ROUTES.iter() {
        let mount = format!("/arvados/v1/{}", route.prefix);
        if path == mount || path.starts_with(&format!("{mount}/")) {
            return RouteTarget::Generic(route);
        }
    }
    RouteTarget::Passthrough
}

/// Merged view of query-string and form-body parameters, preserving
/// multiplicity per key.
#[derive(Debug, Default)]
pub(crate) struct Params(BTreeMap<String, Vec<String>>);

impl Params {
    pub fn from_query(query: &str) -> Self {
        let mut params = Params::default();
        params.merge(query.as_bytes());
        params
    }

    /// Adds the parameters of a form-urlencoded body. The body itself stays
    /// with the request so it can be forwarded downstream.
    pub fn merge_form_body(&mut self, body: &[u8]) {
        self.merge(body);
    }

    fn merge(&mut self, encoded: &[u8]) {
        for (key, value) in form_urlencoded::parse(encoded) {
            self.0
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }

    /// The value of `key` iff it appears exactly once. Multi-valued keys are
    /// treated as unset.
    pub fn single(&self, key: &str) -> Option<&str> {
        match self.0.get(key).map(Vec::as_slice) {
            Some([value]) => Some(value),
            _ => None,
        }
    }

    pub fn values(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        !self.values(key).is_empty()
    }
}

/// The HTTP method, unless a POST carries a single-valued `_method`
/// parameter. This is the POST-as-GET escape hatch for filter payloads too
/// long for a URL.
pub(crate) fn effective_method(method: &Method, params: &Params) -> String {
    if method == Method::POST
        && let Some(override_method) = params.single("_method")
    {
        return override_method.to_string();
    }
    method.as_str().to_string()
}

pub(crate) fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}
