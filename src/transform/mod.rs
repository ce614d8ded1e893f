//! Body transformation applied on the write path. Transformers run in
//! ascending priority order; each stage's output feeds the next stage. A
//! stage may short-circuit the chain by returning `Ok(false)`, in which
//! case the bytes it already wrote become the final body.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

mod minify;

/// Runs before everything else; truncators live here.
pub const PRIORITY_FIRST: i32 = 10;
/// Wire-encoding removal such as base64.
pub const PRIORITY_DECODE: i32 = 50;
/// Content fixups such as prefix stripping.
pub const PRIORITY_MODIFY: i32 = 60;
/// Size reduction.
pub const PRIORITY_MINIFY: i32 = 80;
/// Runs after everything else.
pub const PRIORITY_LAST: i32 = 90;

/// A write-path body transform. `transform` receives the current body and
/// the request/response context, writes its output to `out`, and returns
/// whether lower-priority transformers should still run.
pub trait BodyTransformer: Send + Sync {
    /// Pipeline position; smaller runs earlier.
    fn priority(&self) -> i32;

    fn transform(
        &self,
        out: &mut Vec<u8>,
        input: &[u8],
        url: &str,
        status: u16,
        content_type: &str,
    ) -> Result<bool>;
}

/// Sorts a transformer chain into execution order. Insertion order is
/// preserved among equal priorities.
pub(crate) fn sort_chain(transformers: &mut [Arc<dyn BodyTransformer>]) {
    transformers.sort_by_key(|transformer| transformer.priority());
}

/// Feeds the body through the chain, honoring short-circuits. The chain is
/// assumed to be sorted already.
pub(crate) fn apply_chain(
    transformers: &[Arc<dyn BodyTransformer>],
    body: &[u8],
    url: &str,
    status: u16,
    content_type: &str,
) -> Result<Vec<u8>> {
    let mut current = body.to_vec();
    for transformer in transformers {
        let mut out = Vec::new();
        let proceed = transformer.transform(&mut out, &current, url, status, content_type)?;
        current = out;
        if !proceed {
            break;
        }
    }
    Ok(current)
}

/// Predicate deciding whether a truncator discards the body.
pub type TruncateMatch = dyn Fn(&str, u16, &str) -> bool + Send + Sync;

/// Drops the body entirely when its predicate matches, ending the chain.
pub struct Truncator {
    priority: i32,
    matches: Arc<TruncateMatch>,
}

impl Truncator {
    pub fn new<F>(priority: i32, matches: F) -> Self
    where
        F: Fn(&str, u16, &str) -> bool + Send + Sync + 'static,
    {
        Self {
            priority,
            matches: Arc::new(matches),
        }
    }

    /// Truncates any response whose status is not 200 OK.
    pub fn errors() -> Self {
        Self::new(PRIORITY_FIRST, |_, status, _| status != 200)
    }

    /// Truncates any response whose status is not in the allowed set.
    pub fn status_codes(allowed: Vec<u16>) -> Self {
        Self::new(PRIORITY_FIRST, move |_, status, _| {
            !allowed.contains(&status)
        })
    }
}

impl BodyTransformer for Truncator {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn transform(
        &self,
        out: &mut Vec<u8>,
        input: &[u8],
        url: &str,
        status: u16,
        content_type: &str,
    ) -> Result<bool> {
        if (self.matches.as_ref())(url, status, content_type) {
            return Ok(false);
        }
        out.extend_from_slice(input);
        Ok(true)
    }
}

/// Base64-decodes bodies for the configured content types; anything else
/// passes through untouched.
pub struct Base64Decoder {
    priority: i32,
    content_types: Vec<String>,
}

impl Base64Decoder {
    pub fn new<I, S>(content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            priority: PRIORITY_DECODE,
            content_types: content_types.into_iter().map(Into::into).collect(),
        }
    }
}

impl BodyTransformer for Base64Decoder {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn transform(
        &self,
        out: &mut Vec<u8>,
        input: &[u8],
        _url: &str,
        _status: u16,
        content_type: &str,
    ) -> Result<bool> {
        let content_type = strip_parameters(content_type);
        if !self.content_types.iter().any(|ct| ct == content_type) {
            out.extend_from_slice(input);
            return Ok(true);
        }
        // Line breaks are framing, not payload.
        let compact: Vec<u8> = input
            .iter()
            .copied()
            .filter(|&b| b != b'\r' && b != b'\n')
            .collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&compact)
            .context("failed to base64-decode response body")?;
        out.extend_from_slice(&decoded);
        Ok(true)
    }
}

/// Strips a fixed prefix from bodies of the configured content types. A
/// gated body that lacks the prefix is an error.
pub struct PrefixStripper {
    priority: i32,
    prefix: Vec<u8>,
    content_types: Vec<String>,
}

impl PrefixStripper {
    pub fn new<I, S>(prefix: impl Into<Vec<u8>>, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            priority: PRIORITY_MODIFY,
            prefix: prefix.into(),
            content_types: content_types.into_iter().map(Into::into).collect(),
        }
    }
}

impl BodyTransformer for PrefixStripper {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn transform(
        &self,
        out: &mut Vec<u8>,
        input: &[u8],
        _url: &str,
        _status: u16,
        content_type: &str,
    ) -> Result<bool> {
        let content_type = strip_parameters(content_type);
        if !self.content_types.iter().any(|ct| ct == content_type) {
            out.extend_from_slice(input);
            return Ok(true);
        }
        if !input.starts_with(&self.prefix) {
            return Err(anyhow!(
                "response body missing prefix {:?}",
                String::from_utf8_lossy(&self.prefix)
            ));
        }
        out.extend_from_slice(&input[self.prefix.len()..]);
        Ok(true)
    }
}

static JS_CONTENT_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^(application|text)/(x-)?(java|ecma)script$")
        .expect("static content-type pattern failed to compile")
});
static JSON_CONTENT_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new("[/+]json$").expect("static content-type pattern failed to compile"));
static XML_CONTENT_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new("[/+]xml$").expect("static content-type pattern failed to compile"));

/// Minifies HTML, CSS, SVG, XML, JSON, and JavaScript bodies to reduce
/// on-disk size. Other content types pass through.
pub struct Minifier {
    priority: i32,
}

impl Minifier {
    pub fn new() -> Self {
        Self {
            priority: PRIORITY_MINIFY,
        }
    }
}

impl Default for Minifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyTransformer for Minifier {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn transform(
        &self,
        out: &mut Vec<u8>,
        input: &[u8],
        url: &str,
        _status: u16,
        content_type: &str,
    ) -> Result<bool> {
        let content_type = strip_parameters(content_type);
        match content_type {
            "text/html" => minify::html(out, input, url)?,
            "text/css" => minify::css(out, input)?,
            "image/svg+xml" => minify::markup(out, input)?,
            other if JS_CONTENT_TYPE.is_match(other) => minify::js(out, input)?,
            other if JSON_CONTENT_TYPE.is_match(other) => minify::json(out, input)?,
            other if XML_CONTENT_TYPE.is_match(other) => minify::markup(out, input)?,
            _ => out.extend_from_slice(input),
        }
        Ok(true)
    }
}

/// Drops any `;charset=...` style parameters from a content type.
fn strip_parameters(content_type: &str) -> &str {
    match content_type.find(';') {
        Some(index) => content_type[..index].trim(),
        None => content_type.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<&'static str>>>,
        proceed: bool,
    }

    impl BodyTransformer for Recorder {
        fn priority(&self) -> i32 {
            self.priority
        }

        fn transform(
            &self,
            out: &mut Vec<u8>,
            input: &[u8],
            _url: &str,
            _status: u16,
            _content_type: &str,
        ) -> Result<bool> {
            self.log.lock().unwrap().push(self.label);
            out.extend_from_slice(input);
            out.extend_from_slice(self.label.as_bytes());
            Ok(self.proceed)
        }
    }

    fn recorder(
        label: &'static str,
        priority: i32,
        log: &Arc<Mutex<Vec<&'static str>>>,
        proceed: bool,
    ) -> Arc<dyn BodyTransformer> {
        Arc::new(Recorder {
            label,
            priority,
            log: log.clone(),
            proceed,
        })
    }

    #[test]
    fn chain_runs_in_ascending_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = vec![
            recorder("c", PRIORITY_MINIFY, &log, true),
            recorder("a", PRIORITY_FIRST, &log, true),
            recorder("b", PRIORITY_DECODE, &log, true),
        ];
        sort_chain(&mut chain);
        let out = apply_chain(&chain, b".", "http://x/", 200, "").unwrap();
        assert_eq!(&*log.lock().unwrap(), &["a", "b", "c"]);
        assert_eq!(out, b".abc");
    }

    #[test]
    fn short_circuit_skips_later_transformers_and_keeps_written_bytes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![
            recorder("a", PRIORITY_FIRST, &log, true),
            recorder("b", PRIORITY_DECODE, &log, false),
            recorder("c", PRIORITY_MINIFY, &log, true),
        ];
        let out = apply_chain(&chain, b".", "http://x/", 200, "").unwrap();
        assert_eq!(&*log.lock().unwrap(), &["a", "b"]);
        assert_eq!(out, b".ab");
    }

    #[test]
    fn error_truncator_discards_non_ok_bodies() {
        let chain: Vec<Arc<dyn BodyTransformer>> = vec![Arc::new(Truncator::errors())];
        let out = apply_chain(&chain, b"missing", "http://x/", 404, "text/plain").unwrap();
        assert!(out.is_empty());
        let out = apply_chain(&chain, b"ok", "http://x/", 200, "text/plain").unwrap();
        assert_eq!(out, b"ok");
    }

    #[test]
    fn status_code_truncator_allows_listed_codes() {
        let chain: Vec<Arc<dyn BodyTransformer>> =
            vec![Arc::new(Truncator::status_codes(vec![200, 301]))];
        let out = apply_chain(&chain, b"moved", "http://x/", 301, "").unwrap();
        assert_eq!(out, b"moved");
        let out = apply_chain(&chain, b"nope", "http://x/", 500, "").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn base64_decoder_gates_on_content_type() {
        let decoder = Base64Decoder::new(["application/octet-stream"]);
        let mut out = Vec::new();
        decoder
            .transform(&mut out, b"aGVsbG8=", "http://x/", 200, "text/plain")
            .unwrap();
        assert_eq!(out, b"aGVsbG8=");

        let mut out = Vec::new();
        decoder
            .transform(
                &mut out,
                b"aGVs\r\nbG8=",
                "http://x/",
                200,
                "application/octet-stream; charset=binary",
            )
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn base64_decoder_reports_invalid_input() {
        let decoder = Base64Decoder::new(["text/plain"]);
        let mut out = Vec::new();
        let err = decoder
            .transform(&mut out, b"!!!", "http://x/", 200, "text/plain")
            .unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn prefix_stripper_removes_declared_prefix() {
        let stripper = PrefixStripper::new(&b")]}'\n"[..], ["application/json"]);
        let mut out = Vec::new();
        stripper
            .transform(&mut out, b")]}'\n{\"a\":1}", "http://x/", 200, "application/json")
            .unwrap();
        assert_eq!(out, b"{\"a\":1}");
    }

    #[test]
    fn prefix_stripper_errors_on_missing_prefix() {
        let stripper = PrefixStripper::new(&b")]}'\n"[..], ["application/json"]);
        let mut out = Vec::new();
        let err = stripper
            .transform(&mut out, b"{\"a\":1}", "http://x/", 200, "application/json")
            .unwrap_err();
        assert!(err.to_string().contains("missing prefix"));
    }

    #[test]
    fn prefix_stripper_passes_other_content_types() {
        let stripper = PrefixStripper::new(&b")]}'\n"[..], ["application/json"]);
        let mut out = Vec::new();
        stripper
            .transform(&mut out, b"plain", "http://x/", 200, "text/plain")
            .unwrap();
        assert_eq!(out, b"plain");
    }

    #[test]
    fn minifier_dispatches_on_content_type() {
        let minifier = Minifier::new();

        let mut out = Vec::new();
        minifier
            .transform(
                &mut out,
                b"{ \"a\" : 1 }",
                "http://x/",
                200,
                "application/json; charset=utf-8",
            )
            .unwrap();
        assert_eq!(out, b"{\"a\":1}");

        let mut out = Vec::new();
        minifier
            .transform(
                &mut out,
                b"<p>a</p>\n  <p>b</p>",
                "http://x/",
                200,
                "text/html",
            )
            .unwrap();
        assert_eq!(out, b"<p>a</p><p>b</p>");
    }

    #[test]
    fn minifier_passes_unknown_content_types() {
        let minifier = Minifier::new();
        let mut out = Vec::new();
        minifier
            .transform(&mut out, b"\x00\x01binary", "http://x/", 200, "image/png")
            .unwrap();
        assert_eq!(out, b"\x00\x01binary");
    }

    #[test]
    fn content_type_patterns_match_variants() {
        assert!(JS_CONTENT_TYPE.is_match("application/javascript"));
        assert!(JS_CONTENT_TYPE.is_match("text/x-ecmascript"));
        assert!(!JS_CONTENT_TYPE.is_match("application/json"));
        assert!(JSON_CONTENT_TYPE.is_match("application/vnd.api+json"));
        assert!(XML_CONTENT_TYPE.is_match("application/rss+xml"));
    }
}
