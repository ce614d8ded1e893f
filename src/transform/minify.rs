//! Byte-level minification primitives used by the minifying body
//! transformer. These are deliberately conservative: they only remove
//! content that cannot change how a document is interpreted.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tracing::trace;

static INTER_TAG_WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r">\s+<").expect("static minify pattern failed to compile"));
static CSS_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("static minify pattern failed to compile"));
static WHITESPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("static minify pattern failed to compile"));
static CSS_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*([{};:,])\s*").expect("static minify pattern failed to compile"));

/// Re-serializes a JSON document in compact form. Invalid JSON is an error;
/// the caller decides whether that aborts the request.
pub(crate) fn json(out: &mut Vec<u8>, input: &[u8]) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_slice(input).context("minify: invalid JSON document")?;
    let compact = serde_json::to_vec(&value).context("minify: failed to re-serialize JSON")?;
    out.extend_from_slice(&compact);
    Ok(())
}

/// Collapses whitespace runs between markup tags. Shared by the XML and
/// SVG paths.
pub(crate) fn markup(out: &mut Vec<u8>, input: &[u8]) -> Result<()> {
    let collapsed = INTER_TAG_WHITESPACE.replace_all(trim(input), &b"><"[..]);
    out.extend_from_slice(&collapsed);
    Ok(())
}

/// HTML minification. The document URL is received so implementations that
/// rewrite relative references have it available.
pub(crate) fn html(out: &mut Vec<u8>, input: &[u8], url: &str) -> Result<()> {
    trace!(url, "minifying html document");
    markup(out, input)
}

/// Strips comments and normalizes whitespace around CSS separators.
pub(crate) fn css(out: &mut Vec<u8>, input: &[u8]) -> Result<()> {
    let stripped = CSS_COMMENT.replace_all(input, &b""[..]);
    let collapsed = WHITESPACE_RUN.replace_all(&stripped, &b" "[..]);
    let tightened = CSS_SEPARATOR.replace_all(&collapsed, &b"$1"[..]);
    out.extend_from_slice(trim(&tightened));
    Ok(())
}

/// JavaScript is only lightly compacted: trailing whitespace and blank
/// lines go, token-level rewriting stays out of scope.
pub(crate) fn js(out: &mut Vec<u8>, input: &[u8]) -> Result<()> {
    let mut first = true;
    for line in input.split(|&b| b == b'\n') {
        let line = trim_end(line);
        if line.is_empty() {
            continue;
        }
        if !first {
            out.push(b'\n');
        }
        out.extend_from_slice(line);
        first = false;
    }
    Ok(())
}

fn trim(buf: &[u8]) -> &[u8] {
    let start = buf
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(buf.len());
    let end = buf
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |index| index + 1);
    &buf[start..end]
}

fn trim_end(buf: &[u8]) -> &[u8] {
    let end = buf
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |index| index + 1);
    &buf[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_compacts_whitespace() {
        let mut out = Vec::new();
        json(&mut out, b"{\n  \"a\": [1, 2,   3],\n  \"b\": \"x y\"\n}\n").unwrap();
        assert_eq!(out, br#"{"a":[1,2,3],"b":"x y"}"#);
    }

    #[test]
    fn json_rejects_invalid_documents() {
        let mut out = Vec::new();
        let err = json(&mut out, b"{not json").unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn markup_collapses_inter_tag_whitespace() {
        let mut out = Vec::new();
        markup(&mut out, b"<ul>\n  <li>a</li>\n  <li>b</li>\n</ul>\n").unwrap();
        assert_eq!(out, b"<ul><li>a</li><li>b</li></ul>");
    }

    #[test]
    fn markup_keeps_text_content_intact() {
        let mut out = Vec::new();
        markup(&mut out, b"<p>a b  c</p>").unwrap();
        assert_eq!(out, b"<p>a b  c</p>");
    }

    #[test]
    fn css_strips_comments_and_tightens_separators() {
        let mut out = Vec::new();
        css(
            &mut out,
            b"/* header */\nbody {\n  color : red ;\n  margin: 0 auto;\n}\n",
        )
        .unwrap();
        assert_eq!(out, b"body{color:red;margin:0 auto;}");
    }

    #[test]
    fn js_drops_blank_lines_and_trailing_whitespace() {
        let mut out = Vec::new();
        js(&mut out, b"var a = 1;   \n\n\nvar b = 2;\n").unwrap();
        assert_eq!(out, b"var a = 1;\nvar b = 2;");
    }
}
