//! Request classification. A matcher decides whether a request is cached
//! at all and, when it is, derives the artifact key and the policy that
//! governs it. Keys are pure functions of the request method, URL, and
//! matcher configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::Request;
use crate::policy::Policy;

/// Maps a request to an artifact key and policy, or `None` when the request
/// falls outside this matcher.
pub trait Matcher: Send + Sync {
    fn match_request(&self, req: &Request) -> Result<Option<(String, Policy)>>;
}

/// Renders the decoded query pairs of a matched request into the value the
/// key template substitutes for `{{query}}`.
pub type QueryEncoder = dyn Fn(&[(String, String)]) -> String + Send + Sync;

/// Post-processes a finished key, typically to bucket keys that exceed a
/// filesystem-friendly length.
pub type LongPathHandler = dyn Fn(String) -> String + Send + Sync;

static SLASH_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new("/+").expect("static key pattern failed to compile"));

/// The standard matcher: a method glob, a host regex evaluated against
/// `scheme://host[:port]`, a path regex, and a key template referencing
/// `{{method}}`, `{{query}}`, and any named capture of the two regexes.
pub struct PatternMatcher {
    method: Regex,
    host: Regex,
    path: Regex,
    template: String,
    pub(crate) index_path: String,
    pub(crate) query_encoder: Option<Arc<QueryEncoder>>,
    pub(crate) long_path: Option<Arc<LongPathHandler>>,
    pub(crate) policy: Policy,
}

impl PatternMatcher {
    /// Compiles a matcher from its method glob (`GET`, `{GET,HEAD}`, `*`),
    /// host and path regexes, and key template. Pattern compilation errors
    /// surface here; matching itself never fails.
    pub fn new(methods: &str, host: &str, path: &str, template: &str) -> Result<Self> {
        Ok(Self {
            method: compile_method_glob(methods)?,
            host: Regex::new(host).with_context(|| format!("invalid host pattern '{host}'"))?,
            path: Regex::new(path).with_context(|| format!("invalid path pattern '{path}'"))?,
            template: template.to_string(),
            index_path: String::new(),
            query_encoder: None,
            long_path: None,
            policy: Policy::default(),
        })
    }

    /// Applies a matcher-scoped setting, builder style.
    pub fn with(mut self, setting: crate::config::Setting) -> Result<Self> {
        setting.apply_matcher(&mut self)?;
        Ok(self)
    }

    pub(crate) fn set_methods(&mut self, methods: &[String]) -> Result<()> {
        self.method = compile_method_glob(&format!("{{{}}}", methods.join(",")))?;
        Ok(())
    }

    fn build_key(&self, req: &Request) -> Option<String> {
        if !self.method.is_match(req.method().as_str()) {
            return None;
        }
        let uri = req.uri();
        let origin = format!(
            "{}://{}",
            uri.scheme_str().unwrap_or(""),
            uri.authority().map(|authority| authority.as_str()).unwrap_or(""),
        );
        let host_caps = self.host.captures(&origin)?;
        let path_caps = self.path.captures(uri.path())?;

        let mut pairs: Vec<(String, String)> = vec![(
            "{{method}}".to_string(),
            req.method().as_str().to_lowercase(),
        )];
        for (regex, caps) in [(&self.host, &host_caps), (&self.path, &path_caps)] {
            for name in regex.capture_names().flatten() {
                let value = caps.name(name).map(|m| m.as_str()).unwrap_or("");
                pairs.push((format!("{{{{{name}}}}}"), value.to_string()));
            }
        }
        if let Some(encoder) = &self.query_encoder {
            let query = parse_query(uri.query().unwrap_or(""));
            pairs.push(("{{query}}".to_string(), (encoder.as_ref())(&query)));
        }

        let mut key = self.template.clone();
        for (token, value) in &pairs {
            key = key.replace(token, value);
        }
        if key.is_empty() || key.ends_with('/') {
            key.push_str(&self.index_path);
        }
        let mut key = SLASH_RUN.replace_all(&key, "/").into_owned();
        if let Some(stripped) = key.strip_suffix('/') {
            key = stripped.to_string();
        }
        if let Some(handler) = &self.long_path {
            key = (handler.as_ref())(key);
        }
        Some(key)
    }
}

impl Matcher for PatternMatcher {
    fn match_request(&self, req: &Request) -> Result<Option<(String, Policy)>> {
        Ok(self
            .build_key(req)
            .filter(|key| !key.is_empty())
            .map(|key| (key, self.policy.clone())))
    }
}

/// Translates a method glob into an anchored regex. Supported syntax:
/// `*` and `?` wildcards and `{A,B}` alternation; everything else matches
/// literally.
fn compile_method_glob(pattern: &str) -> Result<Regex> {
    let mut regex = String::from("^");
    let mut depth = 0usize;
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '{' => {
                depth += 1;
                regex.push('(');
            }
            '}' => {
                depth = depth.saturating_sub(1);
                regex.push(')');
            }
            ',' if depth > 0 => regex.push('|'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).with_context(|| format!("invalid method pattern '{pattern}'"))
}

/// Splits and percent-decodes a raw query string into pairs, preserving
/// order of appearance.
fn parse_query(raw: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for part in raw.split('&') {
        if part.is_empty() {
            continue;
        }
        let (name, value) = match part.split_once('=') {
            Some((name, value)) => (name, value),
            None => (part, ""),
        };
        pairs.push((decode_component(name), decode_component(value)));
    }
    pairs
}

fn decode_component(raw: &str) -> String {
    let unplussed = raw.replace('+', " ");
    percent_decode_str(&unplussed)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or(unplussed)
}

/// Escapes a string the way query components are canonically escaped:
/// unreserved characters pass, space becomes `+`, everything else becomes
/// an uppercase percent escape.
pub(crate) fn query_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                escaped.push(byte as char)
            }
            b' ' => escaped.push('+'),
            other => escaped.push_str(&format!("%{other:02X}")),
        }
    }
    escaped
}

/// Builds the standard query encoder: fields are optionally whitelisted,
/// sorted by name, canonically encoded, escaped once more as a whole, and
/// prefixed with `prefix` when the result is non-empty.
pub(crate) fn prefixed_query_encoder(prefix: String, fields: Vec<String>) -> Arc<QueryEncoder> {
    Arc::new(move |pairs: &[(String, String)]| {
        let mut kept: Vec<&(String, String)> = pairs
            .iter()
            .filter(|(name, _)| fields.is_empty() || fields.contains(name))
            .collect();
        kept.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical = kept
            .iter()
            .map(|(name, value)| format!("{}={}", query_escape(name), query_escape(value)))
            .collect::<Vec<_>>()
            .join("&");
        let escaped = query_escape(&canonical);
        if escaped.is_empty() {
            String::new()
        } else {
            format!("{prefix}{escaped}")
        }
    })
}

/// Builds the standard long-path handler: keys longer than `limit` bytes
/// are replaced with `?long/<hex sha-256 of the key>`.
pub(crate) fn hashed_long_path(limit: usize) -> Arc<LongPathHandler> {
    Arc::new(move |key: String| {
        if key.len() <= limit {
            return key;
        }
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("?long/{}", hex::encode(hasher.finalize()))
    })
}

pub(crate) const DEFAULT_LONG_PATH_LIMIT: usize = 128;

/// The matcher every cache starts with: GET requests keyed by
/// `proto/host[:port]/path` with a `_`-prefixed query suffix, `?index` for
/// directory-shaped paths, and sha-256 bucketing for keys over 128 bytes.
pub(crate) fn default_matcher() -> PatternMatcher {
    let mut matcher = PatternMatcher::new(
        "GET",
        r"^(?P<proto>https?)://(?P<host>[^:]+?)(?P<port>:[0-9]+)?$",
        r"^/?(?P<path>.*)$",
        "{{proto}}/{{host}}{{port}}/{{path}}{{query}}",
    )
    .expect("default matcher patterns failed to compile");
    matcher.index_path = "?index".to_string();
    matcher.query_encoder = Some(prefixed_query_encoder("_".to_string(), Vec::new()));
    matcher.long_path = Some(hashed_long_path(DEFAULT_LONG_PATH_LIMIT));
    matcher
}
