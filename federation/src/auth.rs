//! Credential handling for federated dispatch.
//!
//! Before any routing decision, re-entrant requests are detected and pinned
//! to the local backend: a credential that is already in salted form, or a
//! `Via` header naming this gateway, means another gateway instance (or the
//! backend calling back into us) originated the request. Proxying it again
//! would amplify it across the federation.
//!
//! Before a request leaves for a remote, the caller's credential is replaced
//! by its per-remote salted form, and `api_token` is scrubbed from the query
//! string and form body so the derived credential travels only in the
//! `Authorization` header.

use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HeaderValue};
use hyper::body::Bytes;
use hyper::{HeaderMap, Request};
use url::form_urlencoded;

use crate::Gateway;
use crate::errors::{FederationError, Result};
use crate::routes::{FORM_URLENCODED, content_type};
use crate::salt::{SaltError, salt_token};

/// Body cap for the form-token special case. Form bodies are only parsed at
/// all when no credential arrived in the header or query string.
const MAX_FORM_BODY: usize = 1 << 28; // 256 MiB

/// Legacy spelling some clients send for form bodies carrying `api_token`.
const FORM_ENCODED_LEGACY: &str = "application/x-www-form-encoded";

/// Credential record from the authoritative token store.
#[derive(Debug, Clone)]
pub struct TokenAuthorization {
    /// UUID of the authorization record, used to build the versioned form.
    pub uuid: String,
    pub api_token: String,
}

/// Seam to the authoritative token store, consulted when the caller presents
/// a legacy-format credential.
#[async_trait]
pub trait TokenLookup: Send + Sync {
    /// `Ok(None)` means the store does not know the token, so it was
    /// presumably issued by a remote cluster and is forwarded unchanged.
    async fn validate_api_token(&self, token: &str) -> Result<Option<TokenAuthorization>>;
}

/// A store that knows no tokens. Every legacy credential is treated as
/// remote-issued and forwarded as-is.
pub struct NoLocalTokens;

#[async_trait]
impl TokenLookup for NoLocalTokens {
    async fn validate_api_token(&self, _token: &str) -> Result<Option<TokenAuthorization>> {
        Ok(None)
    }
}

/// True when the bearer credential is already in salted form
/// (`v2/<uuid>/<40 hex>`), meaning a gateway already derived it.
pub(crate) fn request_is_pre_salted(headers: &HeaderMap) -> bool {
    let Some(authorization) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let parts: Vec<&str> = authorization.split('/').collect();
    parts.len() == 3 && parts[0] == "Bearer v2" && parts[2].len() == 40
}

/// Requests that must never be proxied again: pre-salted credentials and
/// requests whose Via chain names this gateway.
pub(crate) fn bypass_federation(headers: &HeaderMap) -> bool {
    request_is_pre_salted(headers) || shared::http::via_names_gateway(headers)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let authorization = headers.get(AUTHORIZATION)?.to_str().ok()?;
    authorization
        .strip_prefix("Bearer ")
        .or_else(|| authorization.strip_prefix("OAuth2 "))
        .map(str::to_string)
}

fn accepts_form_token(headers: &HeaderMap) -> bool {
    match content_type(headers) {
        FORM_URLENCODED => true,
        FORM_ENCODED_LEGACY => {
            tracing::warn!(
                content_type = FORM_ENCODED_LEGACY,
                "accepting legacy form content-type spelling"
            );
            true
        }
        _ => false,
    }
}

impl Gateway {
    /// Extracts the caller's credential from `req` and replaces it with the
    /// form salted for `remote`. Scrubs `api_token` from the places it may
    /// have ridden in.
    pub(crate) async fn salt_auth_token(
        &self,
        req: &mut Request<Bytes>,
        remote: &str,
    ) -> Result<()> {
        let mut token = bearer_token(req.headers());

        if token.is_none()
            && let Some(query) = req.uri().query()
        {
            token = form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "api_token")
                .map(|(_, value)| value.into_owned());
        }

        if token.is_none() && accepts_form_token(req.headers()) {
            if req.body().len() > MAX_FORM_BODY {
                return Err(FederationError::RequestBodyError(
                    "form body too large".to_string(),
                ));
            }
            let form: Vec<(String, String)> =
                form_urlencoded::parse(req.body()).into_owned().collect();
            token = form
                .iter()
                .find(|(key, _)| key == "api_token")
                .map(|(_, value)| value.clone());

            // Re-encode the body without api_token, in case we end up
            // forwarding the request.
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (key, value) in form.iter().filter(|(key, _)| key != "api_token") {
                serializer.append_pair(key, value);
            }
            let reencoded = serializer.finish();
            req.headers_mut().insert(
                CONTENT_LENGTH,
                HeaderValue::from_str(&reencoded.len().to_string())
                    .map_err(|e| FederationError::InternalError(e.to_string()))?,
            );
            *req.body_mut() = Bytes::from(reencoded);
        }

        let Some(token) = token else {
            // No credential: forward as-is and let the destination reject it.
            return Ok(());
        };

        let salted = match salt_token(&token, remote) {
            Ok(salted) => salted,
            Err(SaltError::ObsoleteFormat) => {
                // If the token exists in our own store, salt its versioned
                // form for the remote. Otherwise assume it was issued by the
                // remote and pass it through unmodified.
                match self.token_lookup.validate_api_token(&token).await? {
                    None => token.clone(),
                    Some(authorization) => salt_token(
                        &format!("v2/{}/{}", authorization.uuid, authorization.api_token),
                        remote,
                    )
                    .map_err(|e| FederationError::BadRequest(e.to_string()))?,
                }
            }
            Err(e) => return Err(FederationError::BadRequest(e.to_string())),
        };

        req.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {salted}"))
                .map_err(|e| FederationError::InternalError(e.to_string()))?,
        );

        // Remove api_token=... from the query string, in case we end up
        // forwarding the request.
        if let Some(query) = req.uri().query() {
            let pairs: Vec<(String, String)> =
                form_urlencoded::parse(query.as_bytes()).into_owned().collect();
            if pairs.iter().any(|(key, _)| key == "api_token") {
                let mut serializer = form_urlencoded::Serializer::new(String::new());
                for (key, value) in pairs.iter().filter(|(key, _)| key != "api_token") {
                    serializer.append_pair(key, value);
                }
                let reencoded = serializer.finish();
                let path = req.uri().path();
                let new_uri = if reencoded.is_empty() {
                    path.to_string()
                } else {
                    format!("{path}?{reencoded}")
                };
                *req.uri_mut() = new_uri
                    .parse()
                    .map_err(|e| FederationError::InternalError(format!("{e}")))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{StaticTokenLookup, test_gateway};
    use http::header::{CONTENT_TYPE as CONTENT_TYPE_NAME, VIA};

    const UNSALTED: &str = "v2/zhome-gj3su-077z32aux8dg2s1/secretpartofthetoken";

    fn request(uri: &str) -> Request<Bytes> {
        Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    #[test]
    fn test_pre_salted_detection() {
        let mut headers = HeaderMap::new();
        assert!(!request_is_pre_salted(&headers));

        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!(
                "Bearer v2/zhome-gj3su-077z32aux8dg2s1/{}",
                "a".repeat(40)
            ))
            .unwrap(),
        );
        assert!(request_is_pre_salted(&headers));

        // Unsalted secret (wrong length) is not a short-circuit
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {UNSALTED}")).unwrap(),
        );
        assert!(!request_is_pre_salted(&headers));
    }

    #[test]
    fn test_bypass_on_via_header() {
        let mut headers = HeaderMap::new();
        headers.insert(VIA, HeaderValue::from_static("1.1 crossgate"));
        assert!(bypass_federation(&headers));
    }

    #[tokio::test]
    async fn test_salts_header_token() {
        let gateway = test_gateway(&[("zzzzz", "127.0.0.1:1", false)]);
        let mut req = request("/arvados/v1/workflows/zzzzz-7fd4e-abcdefghijklmno");
        req.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {UNSALTED}")).unwrap(),
        );

        gateway.salt_auth_token(&mut req, "zzzzz").await.unwrap();

        let authorization = req.headers()[AUTHORIZATION].to_str().unwrap();
        let parts: Vec<&str> = authorization.split('/').collect();
        assert_eq!(parts[0], "Bearer v2");
        assert_eq!(parts[2].len(), 40);
        assert!(request_is_pre_salted(req.headers()));
    }

    #[tokio::test]
    async fn test_query_token_moves_to_header_and_is_stripped() {
        let gateway = test_gateway(&[("zmock", "127.0.0.1:1", false)]);
        let mut req = request(&format!(
            "/arvados/v1/workflows/zmock-7fd4e-abcdefghijklmno?api_token={UNSALTED}&select=uuid"
        ));

        gateway.salt_auth_token(&mut req, "zmock").await.unwrap();

        assert!(request_is_pre_salted(req.headers()));
        let query = req.uri().query().unwrap();
        assert!(!query.contains("api_token"));
        assert!(query.contains("select=uuid"));
    }

    #[tokio::test]
    async fn test_form_body_token_both_spellings() {
        for spelling in [FORM_URLENCODED, FORM_ENCODED_LEGACY] {
            let gateway = test_gateway(&[("zzzzz", "127.0.0.1:1", false)]);
            let mut req = Request::builder()
                .method("POST")
                .uri("/arvados/v1/workflows")
                .header(CONTENT_TYPE_NAME, spelling)
                .body(Bytes::from(format!("api_token={UNSALTED}&count=none")))
                .unwrap();

            gateway.salt_auth_token(&mut req, "zzzzz").await.unwrap();

            assert!(request_is_pre_salted(req.headers()));
            let body = std::str::from_utf8(req.body()).unwrap();
            assert!(!body.contains("api_token"));
            assert!(body.contains("count=none"));
            assert_eq!(
                req.headers()[CONTENT_LENGTH].to_str().unwrap(),
                body.len().to_string()
            );
        }
    }

    #[tokio::test]
    async fn test_header_token_leaves_body_alone() {
        let gateway = test_gateway(&[("zzzzz", "127.0.0.1:1", false)]);
        let mut req = Request::builder()
            .method("POST")
            .uri("/arvados/v1/workflows")
            .header(CONTENT_TYPE_NAME, FORM_URLENCODED)
            .header(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {UNSALTED}")).unwrap(),
            )
            .body(Bytes::from_static(b"api_token=body-token&count=none"))
            .unwrap();

        gateway.salt_auth_token(&mut req, "zzzzz").await.unwrap();

        // The header credential won; the body was never parsed
        assert!(req.body().starts_with(b"api_token=body-token"));
    }

    #[tokio::test]
    async fn test_obsolete_token_known_locally() {
        let legacy = "3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1";
        let mut gateway = test_gateway(&[("zzzzz", "127.0.0.1:1", false)]);
        gateway.token_lookup = std::sync::Arc::new(StaticTokenLookup::with_token(
            legacy,
            TokenAuthorization {
                uuid: "zhome-gj3su-000000000000000".to_string(),
                api_token: legacy.to_string(),
            },
        ));
        let gateway = std::sync::Arc::new(gateway);

        let mut req = request("/arvados/v1/workflows");
        req.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {legacy}")).unwrap(),
        );

        gateway.salt_auth_token(&mut req, "zzzzz").await.unwrap();
        assert!(request_is_pre_salted(req.headers()));
    }

    #[tokio::test]
    async fn test_obsolete_token_unknown_passes_through() {
        let legacy = "3kg6k6lzmp9kj5cpkcoxie963cmvjahbt2fod9zru30k1";
        let gateway = test_gateway(&[("zzzzz", "127.0.0.1:1", false)]);
        let mut req = request("/arvados/v1/workflows");
        req.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {legacy}")).unwrap(),
        );

        gateway.salt_auth_token(&mut req, "zzzzz").await.unwrap();
        assert_eq!(
            req.headers()[AUTHORIZATION].to_str().unwrap(),
            format!("Bearer {legacy}")
        );
    }

    #[tokio::test]
    async fn test_malformed_token_rejected() {
        let gateway = test_gateway(&[("zzzzz", "127.0.0.1:1", false)]);
        let mut req = request("/arvados/v1/workflows");
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer Not-A-Token"));

        let err = gateway.salt_auth_token(&mut req, "zzzzz").await.unwrap_err();
        assert!(matches!(err, FederationError::BadRequest(_)));
    }
}
