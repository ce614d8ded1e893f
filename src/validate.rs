//! Response validation. After the orchestrator produces a response, the
//! policy's validator may accept it, force a fresh fetch, or reject it
//! outright. The retry loop re-executes the full write path before asking
//! again.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use http::header::CONTENT_TYPE;

use crate::{Request, Response};

/// The validator's verdict on a produced response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Reject the response. Returning this without an error is itself an
    /// error at the orchestrator.
    Error,
    /// Discard the response and fetch a fresh one, overwriting the artifact.
    Retry,
    /// Return the response to the caller.
    Valid,
}

/// Inspects a produced response together with the artifact's modification
/// time and whether this round performed a network fetch.
pub trait Validator: Send + Sync {
    fn validate(
        &self,
        req: &Request,
        res: &Response,
        modified: SystemTime,
        stale: bool,
    ) -> Result<Validity>;
}

type ValidateFn =
    dyn Fn(&Request, &Response, SystemTime, bool, usize) -> Result<Validity> + Send + Sync;

/// Adapts a closure into a [`Validator`], tracking how many times it has
/// been consulted for the same cache entry. The attempt count is passed to
/// the closure and incremented after each successful invocation.
pub struct FnValidator {
    count: AtomicUsize,
    validate: Arc<ValidateFn>,
}

impl FnValidator {
    pub fn new<F>(validate: F) -> Self
    where
        F: Fn(&Request, &Response, SystemTime, bool, usize) -> Result<Validity>
            + Send
            + Sync
            + 'static,
    {
        Self {
            count: AtomicUsize::new(0),
            validate: Arc::new(validate),
        }
    }
}

impl Validator for FnValidator {
    fn validate(
        &self,
        req: &Request,
        res: &Response,
        modified: SystemTime,
        stale: bool,
    ) -> Result<Validity> {
        let count = self.count.load(Ordering::Relaxed);
        let validity = (self.validate.as_ref())(req, res, modified, stale, count)?;
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(validity)
    }
}

/// Retries once the artifact is older than `ttl` and the response carries
/// one of the listed content types. A zero TTL never retries.
pub fn content_type_ttl<I, S>(ttl: Duration, content_types: I) -> FnValidator
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let content_types: Vec<String> = content_types.into_iter().map(Into::into).collect();
    FnValidator::new(move |_req, res, modified, _stale, _count| {
        if !ttl.is_zero() {
            let expired = modified
                .checked_add(ttl)
                .map_or(true, |deadline| SystemTime::now() > deadline);
            let content_type = res
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            if expired && content_types.iter().any(|ct| ct == content_type) {
                return Ok(Validity::Retry);
            }
        }
        Ok(Validity::Valid)
    })
}

/// Retries up to `retries` times while the response status is not in the
/// expected set, then gives the last response back regardless.
pub fn retry_status_code(retries: usize, expected: Vec<u16>) -> FnValidator {
    FnValidator::new(move |_req, res, _modified, _stale, count| {
        if count < retries && !expected.contains(&res.status().as_u16()) {
            return Ok(Validity::Retry);
        }
        Ok(Validity::Valid)
    })
}
