//! The fetch orchestrator: matches requests to policies, decides stale
//! versus fresh, drives the upstream transport through the rewrite and
//! transform pipeline, and persists and rehydrates wire-form artifacts.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use http::Method;
use thiserror::Error;
use tracing::{debug, trace};

pub(crate) mod store;
mod upstream;

pub use store::user_cache_dir;
pub use upstream::{Transport, TransportFn};

use crate::matcher::Matcher;
use crate::policy::Policy;
use crate::validate::Validity;
use crate::{Request, Response, rewrite, transform, wire};
use store::{Stat, Store};

/// Request-scoped TTL override. Attach to a request's extensions to
/// supersede the matched policy's TTL for that call only.
///
/// ```
/// use std::time::Duration;
/// use wirestash::TtlOverride;
///
/// let mut req = http::Request::new(bytes::Bytes::new());
/// req.extensions_mut().insert(TtlOverride(Duration::from_millis(1)));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TtlOverride(pub Duration);

/// A cache key resolved to a directory on disk, which can never hold an
/// artifact.
#[derive(Debug, Error)]
#[error("cache path {key:?} is a directory")]
pub struct DirectoryKeyError {
    pub key: String,
}

/// A transparent on-disk HTTP response cache. Sits in front of an upstream
/// [`Transport`]; requests matching a policy are answered from disk while
/// the stored artifact is fresh and re-fetched, rewritten, and re-persisted
/// when it is stale. Construct with [`Cache::builder`](crate::CacheBuilder).
pub struct Cache {
    transport: Arc<dyn Transport>,
    store: Store,
    matchers: Vec<Arc<dyn Matcher>>,
}

impl Cache {
    pub fn builder() -> crate::config::CacheBuilder {
        crate::config::CacheBuilder::new()
    }

    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        store: Store,
        matchers: Vec<Arc<dyn Matcher>>,
    ) -> Self {
        Self {
            transport,
            store,
            matchers,
        }
    }

    /// The single entrypoint: answer `req` from the cache or the upstream
    /// according to the first matching policy. Requests matching no policy
    /// pass through to the transport untouched.
    pub async fn round_trip(&self, req: Request) -> Result<Response> {
        let Some((key, policy)) = self.match_request(&req)? else {
            trace!(method = %req.method(), uri = %req.uri(), "no cache policy, passing through");
            return self.transport.fetch(req).await;
        };

        let effective_ttl = req
            .extensions()
            .get::<TtlOverride>()
            .map(|o| o.0)
            .unwrap_or(policy.ttl);
        let url = req.uri().to_string();

        let mut force = false;
        loop {
            let (stale, modified) = match self.store.stat(&key).await? {
                Stat::Missing => (true, SystemTime::now()),
                Stat::Directory => {
                    return Err(DirectoryKeyError { key: key.clone() }.into());
                }
                Stat::File { modified } => (expired(modified, effective_ttl), modified),
            };

            let payload = if stale || force {
                trace!(key = %key, stale, force, "fetching from upstream");
                self.exec(&key, &policy, &req, &url).await?
            } else {
                trace!(key = %key, "serving from cache");
                self.load(&key, &policy).await?
            };
            let response = wire::parse_response(&payload)
                .with_context(|| format!("stored artifact for {key:?} is not a response"))?;

            let Some(validator) = &policy.validator else {
                return Ok(response);
            };
            match validator.validate(&req, &response, modified, stale || force)? {
                Validity::Valid => return Ok(response),
                Validity::Retry => {
                    trace!(key = %key, "validator requested a retry");
                    force = true;
                }
                Validity::Error => {
                    bail!("validator rejected the response without a cause")
                }
            }
        }
    }

    /// The write path: fetch upstream, rewrite the head, run the body
    /// pipeline, persist the (possibly marshaled) artifact, and return the
    /// pre-marshal payload.
    async fn exec(&self, key: &str, policy: &Policy, req: &Request, url: &str) -> Result<Vec<u8>> {
        let response = self.transport.fetch(wire::clone_request(req)).await?;
        let (parts, body) = response.into_parts();

        let content_type = parts
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut head = wire::dump_head(parts.status, parts.version, &parts.headers);
        head = rewrite::strip_transfer_encoding(head);
        for rewriter in &policy.header_rewriters {
            head = rewriter.rewrite(head);
        }

        let body = transform::apply_chain(
            &policy.body_transformers,
            &body,
            url,
            parts.status.as_u16(),
            &content_type,
        )?;

        // A HEAD request never consumed a body, so the advertised length
        // still describes the resource; otherwise the transforms may have
        // changed it.
        let mut payload = if *req.method() == Method::HEAD {
            head
        } else {
            rewrite::strip_content_length(head)
        };
        payload.extend_from_slice(&body);

        match &policy.marshaler {
            Some(marshaler) => {
                let mut artifact = Vec::new();
                marshaler.marshal(&mut artifact, &payload)?;
                if !artifact.is_empty() {
                    self.store.write(key, &artifact).await?;
                    debug!(key = %key, bytes = artifact.len(), "stored artifact");
                }
            }
            None => {
                if !payload.is_empty() {
                    self.store.write(key, &payload).await?;
                    debug!(key = %key, bytes = payload.len(), "stored artifact");
                }
            }
        }
        Ok(payload)
    }

    /// The read path: raw artifact bytes through the policy marshaler.
    async fn load(&self, key: &str, policy: &Policy) -> Result<Vec<u8>> {
        let raw = self.store.read(key).await?;
        match &policy.marshaler {
            Some(marshaler) => {
                let mut payload = Vec::new();
                marshaler.unmarshal(&mut payload, &raw)?;
                Ok(payload)
            }
            None => Ok(raw),
        }
    }

    /// Finds the first matching policy for the request. `None` means the
    /// request bypasses the cache.
    pub fn match_request(&self, req: &Request) -> Result<Option<(String, Policy)>> {
        for matcher in &self.matchers {
            if let Some(hit) = matcher.match_request(req)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Whether a fresh artifact exists for the request. Costs one stat.
    pub async fn cached(&self, req: &Request) -> Result<bool> {
        let Some((key, policy)) = self.match_request(req)? else {
            return Ok(false);
        };
        let ttl = req
            .extensions()
            .get::<TtlOverride>()
            .map(|o| o.0)
            .unwrap_or(policy.ttl);
        match self.store.stat(&key).await? {
            Stat::File { modified } => Ok(!expired(modified, ttl)),
            _ => Ok(false),
        }
    }

    /// Deletes the artifact for the key matching the request.
    pub async fn evict(&self, req: &Request) -> Result<()> {
        let Some((key, _)) = self.match_request(req)? else {
            bail!("request does not match any cache policy");
        };
        self.evict_key(&key).await
    }

    /// Deletes the artifact stored under `key`.
    pub async fn evict_key(&self, key: &str) -> Result<()> {
        debug!(key = %key, "evicting artifact");
        self.store.remove(key).await
    }
}

fn expired(modified: SystemTime, ttl: Duration) -> bool {
    if ttl.is_zero() {
        return false;
    }
    modified
        .checked_add(ttl)
        .map_or(true, |deadline| SystemTime::now() > deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_never_expires() {
        let old = SystemTime::UNIX_EPOCH;
        assert!(!expired(old, Duration::ZERO));
    }

    #[test]
    fn positive_ttl_is_monotonic() {
        let now = SystemTime::now();
        assert!(!expired(now, Duration::from_secs(3600)));
        assert!(expired(
            now - Duration::from_secs(7200),
            Duration::from_secs(3600)
        ));
    }
}
