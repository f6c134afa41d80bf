//! Response filter contract for the proxy primitives.
//!
//! A filter sees the outcome of an upstream exchange (a collected response or
//! the transport error) and decides what, if anything, reaches the client:
//!
//! - `Pass(response)` streams the (possibly substituted) response.
//! - `Suppress` emits nothing; the dispatcher may fall through to another
//!   source. The federation search uses this to discard losing responses.
//! - Returning `Err` means the filter itself failed; the caller emits a
//!   gateway error.

use hyper::Response;
use hyper::StatusCode;
use hyper::body::Bytes;

use crate::errors::FederationError;

pub enum FilterOutcome {
    Pass(Response<Bytes>),
    Suppress,
}

pub type FilterResult = Result<FilterOutcome, FederationError>;

/// Default filter: pass responses through, surface transport errors.
pub fn passthrough(result: Result<Response<Bytes>, FederationError>) -> FilterResult {
    Ok(FilterOutcome::Pass(result?))
}

/// Converts 404 into "suppress" so the caller can go on to search the
/// federation; anything else passes through.
pub fn suppress_not_found(result: Result<Response<Bytes>, FederationError>) -> FilterResult {
    match result {
        Ok(resp) if resp.status() == StatusCode::NOT_FOUND => Ok(FilterOutcome::Suppress),
        Ok(resp) => Ok(FilterOutcome::Pass(resp)),
        Err(e) => Err(e),
    }
}
