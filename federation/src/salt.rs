//! Per-remote credential derivation.
//!
//! A caller's versioned token `v2/<uuid>/<secret>` is never forwarded to a
//! peer cluster as-is. Instead the secret is replaced by
//! `HMAC-SHA1(key=secret, message=remoteClusterID)`, so the remote can verify
//! the caller's identity against the issuing cluster without ever seeing the
//! original secret. A salted secret is always 40 hex characters, which is how
//! the salted and unsalted forms are told apart.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// Length of a hex-encoded SHA1 digest; marks a secret as already salted.
const SALTED_SECRET_LEN: usize = 40;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SaltError {
    /// Legacy opaque token (41+ lowercase alphanumerics). The caller decides
    /// whether to look it up and re-issue a versioned form.
    #[error("obsolete token format")]
    ObsoleteFormat,

    #[error("badly formatted token")]
    Malformed,

    /// The token was already salted for a different cluster and cannot be
    /// re-derived.
    #[error("token already salted for another cluster")]
    SaltedForOther,
}

/// Derives the credential to present to `remote` from `token`.
///
/// Pure and deterministic; performs no I/O.
pub fn salt_token(token: &str, remote: &str) -> Result<String, SaltError> {
    let mut parts = token.split('/');
    let (Some("v2"), Some(uuid), Some(secret)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(classify_unversioned(token));
    };

    if secret.len() != SALTED_SECRET_LEN {
        // Not salted yet
        let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(remote.as_bytes());
        let salted = hex::encode(mac.finalize().into_bytes());
        Ok(format!("v2/{uuid}/{salted}"))
    } else if uuid.starts_with(remote) {
        // Already salted for the desired remote
        Ok(token.to_string())
    } else {
        Err(SaltError::SaltedForOther)
    }
}

fn classify_unversioned(token: &str) -> SaltError {
    let obsolete = token.len() >= 41
        && token
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if obsolete {
        SaltError::ObsoleteFormat
    } else {
        SaltError::Malformed
    }
}
