//! Outbound HTTP clients for contacting peer clusters and the local backend.
//!
//! Two clients are kept: one that verifies TLS certificates and one that
//! skips verification, selected per remote by its `insecure` flag.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::http::{add_via_header, filter_hop_by_hop};
use std::sync::Arc;

use crate::config::RemoteCluster;
use crate::errors::FederationError;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

pub struct ClientPair {
    secure: HttpClient,
    insecure: HttpClient,
}

impl ClientPair {
    pub fn new() -> std::io::Result<Self> {
        let secure_connector = HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .build();

        let insecure_tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth();
        let insecure_connector = HttpsConnectorBuilder::new()
            .with_tls_config(insecure_tls)
            .https_or_http()
            .enable_http1()
            .build();

        Ok(Self {
            secure: Client::builder(TokioExecutor::new()).build(secure_connector),
            insecure: Client::builder(TokioExecutor::new()).build(insecure_connector),
        })
    }

    pub fn for_remote(&self, remote: &RemoteCluster) -> &HttpClient {
        if remote.insecure {
            &self.insecure
        } else {
            &self.secure
        }
    }

    pub fn secure(&self) -> &HttpClient {
        &self.secure
    }
}

/// Send a request to an upstream, rebuilding the URI on the destination base.
///
/// Handles the complete request/response cycle:
/// - Rebuilds the full URI from the upstream base URL plus the request's
///   path and query
/// - Filters hop-by-hop headers in both directions
/// - Stamps Via in both directions so downstream hops can detect the gateway
/// - Collects the entire response body into bytes
pub async fn send_to_upstream(
    client: &HttpClient,
    upstream_url: &url::Url,
    request: Request<Bytes>,
) -> Result<Response<Bytes>, FederationError> {
    // Use host as identifier for error messages
    let upstream_identifier = upstream_url
        .host_str()
        .unwrap_or(upstream_url.as_str())
        .to_string();

    let path_and_query = match request.uri().path_and_query() {
        Some(pq) => pq.as_str(),
        None => {
            return Err(FederationError::InternalError(
                "Request URI missing path and query".to_string(),
            ));
        }
    };

    let mut url = upstream_url.clone();
    if let Some((path, query)) = path_and_query.split_once('?') {
        url.set_path(path);
        url.set_query(Some(query));
    } else {
        url.set_path(path_and_query);
        url.set_query(None);
    }
    let upstream_uri = url.to_string();

    // Build request to send to upstream with modified URI and filtered headers
    let (mut parts, body) = request.into_parts();
    let request_version = parts.version;
    filter_hop_by_hop(&mut parts.headers, request_version);
    add_via_header(&mut parts.headers, request_version);

    let mut req_builder = Request::builder()
        .method(parts.method)
        .uri(upstream_uri)
        .version(parts.version);

    for (name, value) in parts.headers.iter() {
        req_builder = req_builder.header(name, value);
    }

    let upstream_request = req_builder.body(Full::new(body)).map_err(|e| {
        FederationError::InternalError(format!("Failed to build request: {e}"))
    })?;

    let response = client.request(upstream_request).await.map_err(|e| {
        FederationError::UpstreamRequestFailed(upstream_identifier.clone(), e.to_string())
    })?;

    // Collect response body bytes and filter hop-by-hop headers
    let (mut parts, body) = response.into_parts();
    let response_version = parts.version;
    filter_hop_by_hop(&mut parts.headers, response_version);
    add_via_header(&mut parts.headers, response_version);

    let body_bytes = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| FederationError::ResponseBodyError(e.to_string()))?;

    Ok(Response::from_parts(parts, body_bytes))
}

/// TLS peer verifier that accepts any certificate, for remotes flagged
/// `insecure` in the cluster map.
#[derive(Debug)]
struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::ECDSA_SHA1_Legacy,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
