//! Block signature rewriting for collection manifests.
//!
//! A collection fetched from a peer cluster arrives with `+A<sig>@<stamp>`
//! access hints that only the peer's storage layer accepts. Before handing
//! the record to the client, each signed block locator is rewritten to a
//! `+R<cluster>-<sig>@<stamp>` remote-indirection hint so the client can
//! later fetch the blobs through its own storage layer.
//!
//! Rewriting must not disturb the collection's content address: the md5 of
//! the signature-stripped manifest, length-tagged with the number of bytes
//! hashed, has to equal the record's `portable_data_hash`. The scan feeds
//! two sinks per token (the hasher sees only `hash+size` for signed
//! locators, the output buffer gets the rewritten form) and the response is
//! rejected if the recomputed hash disagrees.

use http::header::{CONTENT_LENGTH, HeaderValue};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::errors::{FederationError, Result};
use crate::filter::{FilterOutcome, FilterResult};

/// A signed block locator: `<md5 hex>+<size>` plus hint tokens, exactly one
/// of which is a `+A<sig>@<stamp>` access signature.
static SIGNED_LOCATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([0-9a-fA-F]{32})(\+[0-9]+)?((?:\+[A-Z][A-Za-z0-9@_-]*)*)(\+A[0-9a-fA-F]+@[0-9a-fA-F]{8})((?:\+[A-Z][A-Za-z0-9@_-]*)*)$",
    )
    .expect("signed locator pattern compiles")
});

/// Longest manifest line the scanner accepts.
const MAX_LINE_LEN: usize = 1 << 20;

/// The slice of a collection record the rewriter touches. Every other field
/// rides along untouched through the flattened map.
#[derive(Debug, Serialize, Deserialize)]
struct CollectionRecord {
    manifest_text: String,
    portable_data_hash: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Rewrites block signatures in a collection response for `remote_id`,
/// verifying the content hash against `expect_hash` (or, when absent, the
/// hash the record itself reports).
pub struct SignatureRewriter {
    pub remote_id: String,
    pub expect_hash: Option<String>,
}

impl SignatureRewriter {
    pub fn new(remote_id: impl Into<String>, expect_hash: Option<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            expect_hash,
        }
    }

    /// Applies the rewrite to a collected response. Non-200 responses pass
    /// through unchanged.
    pub fn rewrite(&self, response: Response<Bytes>) -> Result<Response<Bytes>> {
        if response.status() != StatusCode::OK {
            return Ok(response);
        }

        let (mut parts, body) = response.into_parts();
        let mut record: CollectionRecord = serde_json::from_slice(&body)
            .map_err(|e| FederationError::ResponseBodyError(e.to_string()))?;

        let (updated, computed) = rewrite_manifest(&record.manifest_text, &self.remote_id)?;

        // The caller's expectation wins over whatever the record claims.
        let expect = match &self.expect_hash {
            None => record.portable_data_hash.clone(),
            Some(expect) if *expect == record.portable_data_hash => expect.clone(),
            Some(expect) => {
                return Err(FederationError::PdhMismatch(format!(
                    "portable_data_hash {:?} on returned record did not match expected hash {:?}",
                    record.portable_data_hash, expect
                )));
            }
        };

        if computed != expect {
            return Err(FederationError::PdhMismatch(format!(
                "Computed manifest hash {:?} did not match expected hash {:?}",
                computed, expect
            )));
        }

        record.manifest_text = updated;

        let new_body = serde_json::to_vec(&record)
            .map_err(|e| FederationError::ResponseSerializationError(e.to_string()))?;
        parts.headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&new_body.len().to_string())
                .map_err(|e| FederationError::InternalError(e.to_string()))?,
        );

        Ok(Response::from_parts(parts, Bytes::from(new_body)))
    }

    /// Adapts the rewriter to the proxy filter contract. Transport errors
    /// pass straight through to the caller.
    pub fn into_filter(
        self,
    ) -> impl FnOnce(Result<Response<Bytes>, FederationError>) -> FilterResult {
        move |result| Ok(FilterOutcome::Pass(self.rewrite(result?)?))
    }
}

/// Scans `manifest` line by line, returning the rewritten text and the
/// computed content hash `<md5 hex>+<bytes hashed>`.
fn rewrite_manifest(manifest: &str, remote_id: &str) -> Result<(String, String)> {
    // Rewritten hints make the text 5-10% bigger
    let mut updated = String::with_capacity(manifest.len() + manifest.len() / 10);
    let mut hasher = md5::Context::new();
    let mut hashed = 0usize;

    for line in manifest.split_terminator('\n') {
        if line.len() > MAX_LINE_LEN {
            return Err(FederationError::InvalidStream(format!(
                "line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() < 3 {
            return Err(FederationError::InvalidStream(format!(
                "<3 tokens in line {line:?}"
            )));
        }

        updated.push_str(tokens[0]);
        hasher.consume(tokens[0].as_bytes());
        hashed += tokens[0].len();

        for token in &tokens[1..] {
            let token = *token;
            updated.push(' ');
            hasher.consume(b" ");
            hashed += 1;

            match SIGNED_LOCATOR.captures(token) {
                Some(m) => {
                    let hash = &m[1];
                    let size = m.get(2).map_or("", |g| g.as_str());
                    let unsigned_hints = &m[3];
                    let signature = &m[4];
                    let trailing_hints = &m[5];

                    // Output: signature becomes a remote indirection hint
                    updated.push_str(hash);
                    updated.push_str(size);
                    updated.push_str(unsigned_hints);
                    updated.push_str("+R");
                    updated.push_str(remote_id);
                    updated.push('-');
                    updated.push_str(&signature[2..]);
                    updated.push_str(trailing_hints);

                    // Hash domain: signatures and hints are excluded
                    hasher.consume(hash.as_bytes());
                    hasher.consume(size.as_bytes());
                    hashed += hash.len() + size.len();
                }
                None => {
                    updated.push_str(token);
                    hasher.consume(token.as_bytes());
                    hashed += token.len();
                }
            }
        }

        updated.push('\n');
        hasher.consume(b"\n");
        hashed += 1;
    }

    let digest = hasher.compute();
    Ok((updated, format!("{:x}+{}", digest, hashed)))
}
