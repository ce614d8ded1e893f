//! Configuration surface. A [`Setting`] targets the cache, an individual
//! matcher, or either; applying one to a target it does not support is an
//! error. Cache-scoped policy settings configure the default matcher, whose
//! policy every registered pattern matcher inherits from unless
//! [`Setting::no_default`] is used.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::cache::store::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, Store};
use crate::cache::{Cache, Transport, user_cache_dir};
use crate::marshal::{FlatMarshaler, GzipMarshaler, Marshaler, ZlibMarshaler};
use crate::matcher::{self, Matcher, PatternMatcher};
use crate::rewrite::{HeaderRewriter, KeepHeaders, StripHeaders, SubstituteHeaders};
use crate::transform::{
    self, Base64Decoder, BodyTransformer, Minifier, PrefixStripper, Truncator,
};
use crate::validate::{self, FnValidator, Validator, Validity};
use crate::{Request, Response};

type CacheApply = Box<dyn FnOnce(&mut CacheBuilder) -> Result<()> + Send>;
type MatcherApply = Box<dyn FnOnce(&mut PatternMatcher) -> Result<()> + Send>;

enum Target {
    Cache(CacheApply),
    Matcher(MatcherApply),
    Either {
        cache: CacheApply,
        matcher: MatcherApply,
    },
}

/// A single configuration directive, applied through
/// [`CacheBuilder::with`] or [`PatternMatcher::with`].
pub struct Setting {
    target: Target,
}

impl Setting {
    fn cache_only<F>(apply: F) -> Self
    where
        F: FnOnce(&mut CacheBuilder) -> Result<()> + Send + 'static,
    {
        Self {
            target: Target::Cache(Box::new(apply)),
        }
    }

    /// Builds a policy-level setting valid for both targets; at cache scope
    /// it configures the default matcher.
    fn policy<F>(apply: F) -> Self
    where
        F: Fn(&mut PatternMatcher) -> Result<()> + Send + Sync + 'static,
    {
        let apply = Arc::new(apply);
        let for_cache = apply.clone();
        Self {
            target: Target::Either {
                cache: Box::new(move |builder| (for_cache.as_ref())(&mut builder.default_matcher)),
                matcher: Box::new(move |m| (apply.as_ref())(m)),
            },
        }
    }

    pub(crate) fn apply_cache(self, builder: &mut CacheBuilder) -> Result<()> {
        match self.target {
            Target::Cache(apply) | Target::Either { cache: apply, .. } => apply(builder),
            Target::Matcher(_) => bail!("setting cannot be applied to the cache"),
        }
    }

    pub(crate) fn apply_matcher(self, matcher: &mut PatternMatcher) -> Result<()> {
        match self.target {
            Target::Matcher(apply) | Target::Either { matcher: apply, .. } => apply(matcher),
            Target::Cache(_) => bail!("setting cannot be applied to a matcher"),
        }
    }

    /// Sets the upstream transport the cache interposes on.
    pub fn transport(transport: impl Transport + 'static) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        Self::cache_only(move |builder| {
            builder.transport = Some(transport);
            Ok(())
        })
    }

    /// Sets the directory and file modes used on disk.
    pub fn mode(dir_mode: u32, file_mode: u32) -> Self {
        Self::cache_only(move |builder| {
            builder.dir_mode = dir_mode;
            builder.file_mode = file_mode;
            Ok(())
        })
    }

    /// Roots the cache at the given base directory, created when absent.
    pub fn base_dir(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::cache_only(move |builder| {
            builder.root = Some(path);
            Ok(())
        })
    }

    /// Roots the cache at the platform user cache directory joined with the
    /// application name and any further segments.
    pub fn app_cache_dir<I, S>(app: &str, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let app = app.to_string();
        let segments: Vec<String> = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        Self::cache_only(move |builder| {
            builder.root = Some(user_cache_dir(&app, &segments)?);
            Ok(())
        })
    }

    /// Registers a pattern matcher. Matchers are consulted in registration
    /// order, before the default matcher.
    pub fn matcher(matcher: PatternMatcher) -> Self {
        Self::cache_only(move |builder| {
            builder.matchers.push(MatcherEntry::Pattern(matcher));
            Ok(())
        })
    }

    /// Registers an opaque matcher implementation. Opaque matchers do not
    /// participate in default-policy inheritance.
    pub fn custom_matcher(matcher: Arc<dyn Matcher>) -> Self {
        Self::cache_only(move |builder| {
            builder.matchers.push(MatcherEntry::Custom(matcher));
            Ok(())
        })
    }

    /// Replaces the default matcher.
    pub fn default_matcher(matcher: PatternMatcher) -> Self {
        Self::cache_only(move |builder| {
            builder.default_matcher = matcher;
            Ok(())
        })
    }

    /// Disables the default matcher entirely: unmatched requests bypass the
    /// cache and registered matchers inherit nothing.
    pub fn no_default() -> Self {
        Self::cache_only(|builder| {
            builder.no_default = true;
            Ok(())
        })
    }

    /// Sets the methods the matcher accepts.
    pub fn method<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let methods: Vec<String> = methods.into_iter().map(Into::into).collect();
        Self::policy(move |m| m.set_methods(&methods))
    }

    /// Sets the policy TTL. Zero means artifacts never expire.
    pub fn ttl(ttl: Duration) -> Self {
        Self::policy(move |m| {
            m.policy.ttl = ttl;
            Ok(())
        })
    }

    /// Sets the token appended to empty or directory-shaped keys.
    pub fn index_path(token: &str) -> Self {
        let token = token.to_string();
        Self::policy(move |m| {
            m.index_path = token.clone();
            Ok(())
        })
    }

    /// Sets the post-processor applied to finished keys.
    pub fn long_path_handler<F>(handler: F) -> Self
    where
        F: Fn(String) -> String + Send + Sync + 'static,
    {
        let handler: Arc<matcher::LongPathHandler> = Arc::new(handler);
        Self::policy(move |m| {
            m.long_path = Some(handler.clone());
            Ok(())
        })
    }

    /// Sets the encoder producing the `{{query}}` template value.
    pub fn query_encoder<F>(encoder: F) -> Self
    where
        F: Fn(&[(String, String)]) -> String + Send + Sync + 'static,
    {
        let encoder: Arc<matcher::QueryEncoder> = Arc::new(encoder);
        Self::policy(move |m| {
            m.query_encoder = Some(encoder.clone());
            Ok(())
        })
    }

    /// Sets the standard query encoder: canonical encoding escaped once
    /// more, prefixed when non-empty, optionally limited to the listed
    /// fields.
    pub fn query_prefix<I, S>(prefix: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix = prefix.to_string();
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        Self::policy(move |m| {
            m.query_encoder = Some(matcher::prefixed_query_encoder(
                prefix.clone(),
                fields.clone(),
            ));
            Ok(())
        })
    }

    /// Replaces the policy's header rewriters.
    pub fn header_rewriters(rewriters: Vec<Arc<dyn HeaderRewriter>>) -> Self {
        Self::policy(move |m| {
            m.policy.header_rewriters = rewriters.clone();
            Ok(())
        })
    }

    /// Adds a rewriter removing every header in the denylist.
    pub fn header_denylist<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        Self::policy(move |m| {
            m.policy
                .header_rewriters
                .push(Arc::new(StripHeaders::new(&names)?));
            Ok(())
        })
    }

    /// Adds a rewriter removing every header not in the allowlist.
    pub fn header_allowlist<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        Self::policy(move |m| {
            m.policy
                .header_rewriters
                .push(Arc::new(KeepHeaders::new(&names)?));
            Ok(())
        })
    }

    /// Adds a rewriter applying regex pattern and replacement pairs to
    /// header lines.
    pub fn header_substitutions<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pairs: Vec<String> = pairs.into_iter().map(Into::into).collect();
        Self::policy(move |m| {
            m.policy
                .header_rewriters
                .push(Arc::new(SubstituteHeaders::from_pairs(&pairs)?));
            Ok(())
        })
    }

    /// Replaces the policy's body transformers.
    pub fn body_transformers(transformers: Vec<Arc<dyn BodyTransformer>>) -> Self {
        Self::policy(move |m| {
            m.policy.body_transformers = transformers.clone();
            Ok(())
        })
    }

    /// Adds the minifying body transformer.
    pub fn minifier() -> Self {
        Self::policy(|m| {
            m.policy.body_transformers.push(Arc::new(Minifier::new()));
            Ok(())
        })
    }

    /// Adds a truncating body transformer with an arbitrary predicate.
    pub fn truncator<F>(priority: i32, matches: F) -> Self
    where
        F: Fn(&str, u16, &str) -> bool + Send + Sync + 'static,
    {
        let matches = Arc::new(matches);
        Self::policy(move |m| {
            let matches = matches.clone();
            m.policy
                .body_transformers
                .push(Arc::new(Truncator::new(priority, move |url, status, ct| {
                    (matches.as_ref())(url, status, ct)
                })));
            Ok(())
        })
    }

    /// Adds a truncator discarding bodies of non-200 responses.
    pub fn error_truncator() -> Self {
        Self::policy(|m| {
            m.policy.body_transformers.push(Arc::new(Truncator::errors()));
            Ok(())
        })
    }

    /// Adds a truncator discarding bodies whose status is not in the list.
    pub fn status_code_truncator<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        let statuses: Vec<u16> = statuses.into_iter().collect();
        Self::policy(move |m| {
            m.policy
                .body_transformers
                .push(Arc::new(Truncator::status_codes(statuses.clone())));
            Ok(())
        })
    }

    /// Adds a base64-decoding transformer for the listed content types.
    pub fn base64_decoder<I, S>(content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let content_types: Vec<String> = content_types.into_iter().map(Into::into).collect();
        Self::policy(move |m| {
            m.policy
                .body_transformers
                .push(Arc::new(Base64Decoder::new(content_types.clone())));
            Ok(())
        })
    }

    /// Adds a prefix-stripping transformer for the listed content types.
    /// Useful for removing anti-XSS prefixes from JavaScript or JSON.
    pub fn prefix_stripper<I, S>(prefix: impl Into<Vec<u8>>, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix = prefix.into();
        let content_types: Vec<String> = content_types.into_iter().map(Into::into).collect();
        Self::policy(move |m| {
            m.policy.body_transformers.push(Arc::new(PrefixStripper::new(
                prefix.clone(),
                content_types.clone(),
            )));
            Ok(())
        })
    }

    /// Sets the policy marshaler.
    pub fn marshaler(marshaler: Arc<dyn Marshaler>) -> Self {
        Self::policy(move |m| {
            m.policy.marshaler = Some(marshaler.clone());
            Ok(())
        })
    }

    /// Stores artifacts gzip-compressed.
    pub fn gzip_compression() -> Self {
        Self::marshaler(Arc::new(GzipMarshaler::new()))
    }

    /// Stores artifacts zlib-compressed.
    pub fn zlib_compression() -> Self {
        Self::marshaler(Arc::new(ZlibMarshaler::new()))
    }

    /// Stores artifacts flat: the response head is discarded on write and
    /// synthesized on read.
    pub fn flat_storage() -> Self {
        Self::marshaler(Arc::new(FlatMarshaler::new()))
    }

    /// Stores artifacts flat, chaining the remaining body through another
    /// marshaler.
    pub fn flat_chain(chain: Arc<dyn Marshaler>) -> Self {
        Self::marshaler(Arc::new(FlatMarshaler::chained(chain)))
    }

    /// Flat storage with gzip compression of the body.
    pub fn flat_gzip_compression() -> Self {
        Self::flat_chain(Arc::new(GzipMarshaler::new()))
    }

    /// Flat storage with zlib compression of the body.
    pub fn flat_zlib_compression() -> Self {
        Self::flat_chain(Arc::new(ZlibMarshaler::new()))
    }

    /// Sets the policy validator.
    pub fn validator(validator: Arc<dyn Validator>) -> Self {
        Self::policy(move |m| {
            m.policy.validator = Some(validator.clone());
            Ok(())
        })
    }

    /// Sets a closure-backed validator; the closure receives the request,
    /// response, artifact modification time, staleness, and attempt count.
    pub fn validator_fn<F>(validate: F) -> Self
    where
        F: Fn(&Request, &Response, std::time::SystemTime, bool, usize) -> Result<Validity>
            + Send
            + Sync
            + 'static,
    {
        let validate = Arc::new(validate);
        Self::policy(move |m| {
            let validate = validate.clone();
            m.policy.validator = Some(Arc::new(FnValidator::new(
                move |req, res, modified, stale, count| {
                    (validate.as_ref())(req, res, modified, stale, count)
                },
            )));
            Ok(())
        })
    }

    /// Retries responses of the listed content types once the artifact is
    /// older than `ttl`.
    pub fn content_type_ttl<I, S>(ttl: Duration, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let content_types: Vec<String> = content_types.into_iter().map(Into::into).collect();
        Self::policy(move |m| {
            m.policy.validator = Some(Arc::new(validate::content_type_ttl(
                ttl,
                content_types.clone(),
            )));
            Ok(())
        })
    }

    /// Retries up to `retries` times while the response status is not in
    /// the expected set.
    pub fn retry_status_code<I>(retries: usize, expected: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        let expected: Vec<u16> = expected.into_iter().collect();
        Self::policy(move |m| {
            m.policy.validator = Some(Arc::new(validate::retry_status_code(
                retries,
                expected.clone(),
            )));
            Ok(())
        })
    }
}

enum MatcherEntry {
    Pattern(PatternMatcher),
    Custom(Arc<dyn Matcher>),
}

/// Assembles a [`Cache`]. Policies freeze at [`build`](Self::build):
/// registered pattern matchers inherit the default policy and every
/// transformer chain is sorted into execution order.
pub struct CacheBuilder {
    transport: Option<Arc<dyn Transport>>,
    root: Option<PathBuf>,
    dir_mode: u32,
    file_mode: u32,
    no_default: bool,
    pub(crate) default_matcher: PatternMatcher,
    matchers: Vec<MatcherEntry>,
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            root: None,
            dir_mode: DEFAULT_DIR_MODE,
            file_mode: DEFAULT_FILE_MODE,
            no_default: false,
            default_matcher: matcher::default_matcher(),
            matchers: Vec::new(),
        }
    }

    /// Applies a cache-scoped or either-scoped setting.
    pub fn with(mut self, setting: Setting) -> Result<Self> {
        setting.apply_cache(&mut self)?;
        Ok(self)
    }

    /// Opens the store and freezes matchers and policies. The base
    /// directory defaults to `<working directory>/cache`.
    pub async fn build(mut self) -> Result<Cache> {
        let Some(transport) = self.transport.take() else {
            bail!("a transport is required to build a cache");
        };
        let root = match self.root.take() {
            Some(root) => root,
            None => std::env::current_dir()
                .context("failed to resolve working directory")?
                .join("cache"),
        };
        let store = Store::open(root, self.dir_mode, self.file_mode).await?;

        let mut matchers: Vec<Arc<dyn Matcher>> = Vec::new();
        for entry in self.matchers {
            match entry {
                MatcherEntry::Pattern(mut m) => {
                    if !self.no_default {
                        m.policy.inherit(&self.default_matcher.policy);
                    }
                    transform::sort_chain(&mut m.policy.body_transformers);
                    matchers.push(Arc::new(m));
                }
                MatcherEntry::Custom(m) => matchers.push(m),
            }
        }
        if !self.no_default {
            let mut default = self.default_matcher;
            transform::sort_chain(&mut default.policy.body_transformers);
            matchers.push(Arc::new(default));
        }

        Ok(Cache::new(transport, store, matchers))
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TransportFn;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn dummy_transport() -> Setting {
        Setting::transport(TransportFn::new(|_req: Request| async {
            Ok::<_, anyhow::Error>(Response::new(Bytes::new()))
        }))
    }

    fn request(uri: &str) -> Request {
        let mut req = Request::new(Bytes::new());
        *req.uri_mut() = uri.parse().unwrap();
        req
    }

    #[test]
    fn cache_only_settings_reject_matcher_targets() {
        let matcher = PatternMatcher::new("GET", ".*", ".*", "k").unwrap();
        let err = matcher.with(Setting::no_default()).err().unwrap();
        assert!(err.to_string().contains("cannot be applied to a matcher"));
    }

    #[test]
    fn policy_settings_apply_to_matchers() {
        let matcher = PatternMatcher::new("GET", ".*", ".*", "k")
            .unwrap()
            .with(Setting::ttl(Duration::from_secs(5)))
            .unwrap()
            .with(Setting::error_truncator())
            .unwrap();
        assert_eq!(matcher.policy.ttl, Duration::from_secs(5));
        assert_eq!(matcher.policy.body_transformers.len(), 1);
    }

    #[tokio::test]
    async fn build_requires_a_transport() {
        let err = CacheBuilder::new().build().await.err().unwrap();
        assert!(err.to_string().contains("transport is required"));
    }

    #[tokio::test]
    async fn cache_scope_policy_settings_configure_the_default_matcher() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = Cache::builder()
            .with(dummy_transport())?
            .with(Setting::base_dir(dir.path()))?
            .with(Setting::ttl(Duration::from_secs(30)))?
            .build()
            .await?;
        let (_, policy) = cache
            .match_request(&request("http://example.com/x"))?
            .expect("default matcher should match");
        assert_eq!(policy.ttl, Duration::from_secs(30));
        Ok(())
    }

    #[tokio::test]
    async fn registered_matchers_inherit_the_default_policy() -> Result<()> {
        let dir = TempDir::new()?;
        let user = PatternMatcher::new(
            "GET",
            r"^(?P<proto>https?)://api\.example\.com$",
            r"^/(?P<path>.*)$",
            "api/{{path}}",
        )?
        .with(Setting::minifier())?;

        let cache = Cache::builder()
            .with(dummy_transport())?
            .with(Setting::base_dir(dir.path()))?
            .with(Setting::ttl(Duration::from_secs(60)))?
            .with(Setting::error_truncator())?
            .with(Setting::gzip_compression())?
            .with(Setting::matcher(user))?
            .build()
            .await?;

        let (key, policy) = cache
            .match_request(&request("https://api.example.com/users"))?
            .expect("user matcher should match");
        assert_eq!(key, "api/users");
        assert_eq!(policy.ttl, Duration::from_secs(60));
        // Default truncator first, user minifier second.
        assert_eq!(policy.body_transformers.len(), 2);
        assert!(policy.marshaler.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn no_default_disables_inheritance_and_fallthrough() -> Result<()> {
        let dir = TempDir::new()?;
        let user = PatternMatcher::new(
            "GET",
            r"^(?P<proto>https?)://api\.example\.com$",
            r"^/(?P<path>.*)$",
            "api/{{path}}",
        )?;
        let cache = Cache::builder()
            .with(dummy_transport())?
            .with(Setting::base_dir(dir.path()))?
            .with(Setting::ttl(Duration::from_secs(60)))?
            .with(Setting::matcher(user))?
            .with(Setting::no_default())?
            .build()
            .await?;

        // Matches the user matcher without inheriting the default TTL.
        let (_, policy) = cache
            .match_request(&request("https://api.example.com/users"))?
            .expect("user matcher should match");
        assert_eq!(policy.ttl, Duration::ZERO);

        // Anything else bypasses the cache entirely.
        assert!(cache
            .match_request(&request("http://other.example.com/x"))?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn transformer_chains_are_sorted_at_build() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = Cache::builder()
            .with(dummy_transport())?
            .with(Setting::base_dir(dir.path()))?
            .with(Setting::minifier())?
            .with(Setting::error_truncator())?
            .build()
            .await?;
        let (_, policy) = cache
            .match_request(&request("http://example.com/x"))?
            .expect("default matcher should match");
        let priorities: Vec<i32> = policy
            .body_transformers
            .iter()
            .map(|t| t.priority())
            .collect();
        assert_eq!(
            priorities,
            vec![transform::PRIORITY_FIRST, transform::PRIORITY_MINIFY]
        );
        Ok(())
    }

    #[tokio::test]
    async fn method_setting_widens_the_default_matcher() -> Result<()> {
        let dir = TempDir::new()?;
        let cache = Cache::builder()
            .with(dummy_transport())?
            .with(Setting::base_dir(dir.path()))?
            .with(Setting::method(["GET", "HEAD"]))?
            .build()
            .await?;
        let mut req = request("http://example.com/x");
        *req.method_mut() = http::Method::HEAD;
        assert!(cache.match_request(&req)?.is_some());
        Ok(())
    }
}
