use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// Five-character ID of the cluster this gateway fronts.
    pub cluster_id: String,
    pub listener: Listener,
    pub backend: BackendConfig,
    #[serde(default)]
    pub remote_clusters: HashMap<String, RemoteCluster>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

/// The cluster-local REST backend the gateway fronts.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub url: Url,
}

/// A peer cluster the gateway may dispatch requests to.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RemoteCluster {
    pub host: String,
    /// Defaults to https when the config omits it.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Skip TLS certificate verification when contacting this cluster.
    #[serde(default)]
    pub insecure: bool,
    /// Whether this cluster is an eligible proxy target. Entries with
    /// `proxy: false` are listed for identity purposes only and never
    /// receive forwarded requests.
    #[serde(default)]
    pub proxy: bool,
}

fn default_scheme() -> String {
    "https".to_string()
}

impl RemoteCluster {
    pub fn base_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("{}://{}", self.scheme, self.host))
    }
}
