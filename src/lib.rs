//! Transparent on-disk HTTP response cache.
//!
//! wirestash sits between an HTTP client and its transport. Every outgoing
//! request is classified by a chain of matchers; a match yields a
//! deterministic filesystem key and a policy. While a fresh artifact exists
//! under the key the stored response is rehydrated without any network
//! traffic; otherwise the upstream transport is driven, the wire-form
//! response is rewritten through the policy's header and body transformers,
//! optionally marshaled (compressed, flattened), and persisted.
//!
//! This is deliberately not a standards-compliant HTTP proxy cache: origin
//! freshness directives are ignored. Retention and storage are declared per
//! method/host/path rule by the user.
//!
//! ```no_run
//! use std::time::Duration;
//! use bytes::Bytes;
//! use wirestash::{Cache, Setting, TransportFn};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let cache = Cache::builder()
//!     .with(Setting::transport(TransportFn::new(|_req: wirestash::Request| async move {
//!         // drive your HTTP client here
//!         Ok::<_, anyhow::Error>(http::Response::new(Bytes::from_static(b"hello")))
//!     })))?
//!     .with(Setting::base_dir("/tmp/wirestash"))?
//!     .with(Setting::ttl(Duration::from_secs(3600)))?
//!     .with(Setting::error_truncator())?
//!     .with(Setting::gzip_compression())?
//!     .build()
//!     .await?;
//!
//! let req = http::Request::builder()
//!     .method("GET")
//!     .uri("https://example.com/")
//!     .body(Bytes::new())?;
//! let res = cache.round_trip(req).await?;
//! # drop(res);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod marshal;
pub mod matcher;
pub mod policy;
pub mod rewrite;
pub mod transform;
pub mod validate;
pub mod wire;

/// The request type the cache operates on.
pub type Request = http::Request<bytes::Bytes>;
/// The response type the cache produces.
pub type Response = http::Response<bytes::Bytes>;

pub use cache::{Cache, DirectoryKeyError, Transport, TransportFn, TtlOverride, user_cache_dir};
pub use config::{CacheBuilder, Setting};
pub use marshal::{FlatMarshaler, GzipMarshaler, Marshaler, ZlibMarshaler};
pub use matcher::{Matcher, PatternMatcher};
pub use policy::Policy;
pub use rewrite::{HeaderRewriter, KeepHeaders, StripHeaders, SubstituteHeaders};
pub use transform::{
    Base64Decoder, BodyTransformer, Minifier, PrefixStripper, Truncator, PRIORITY_DECODE,
    PRIORITY_FIRST, PRIORITY_LAST, PRIORITY_MINIFY, PRIORITY_MODIFY,
};
pub use validate::{FnValidator, Validator, Validity};
