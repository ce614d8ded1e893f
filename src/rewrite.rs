//! Head-byte rewriting applied on the write path before an artifact is
//! persisted. Rewriters operate on the raw wire-form head (status line plus
//! header block, CRLF CRLF terminated) and are infallible at runtime; all
//! pattern compilation happens at construction.

use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::wire::CRLF;

/// Rewrites the wire-form head bytes. Implementations must be total: they
/// may drop or rewrite header lines but never fail.
pub trait HeaderRewriter: Send + Sync {
    fn rewrite(&self, head: Vec<u8>) -> Vec<u8>;
}

/// Compiles header-name regex fragments into case-insensitive line patterns
/// anchored on a leading CRLF and the given suffix.
fn compile_patterns<I, S>(suffix: &str, names: I) -> Result<Vec<Regex>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| {
            let name = name.as_ref();
            Regex::new(&format!(r"(?i)\r\n{name}{suffix}"))
                .with_context(|| format!("invalid header pattern '{name}'"))
        })
        .collect()
}

/// Removes every header whose name matches one of the patterns.
pub struct StripHeaders {
    patterns: Vec<Regex>,
}

impl StripHeaders {
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            patterns: compile_patterns(r":.+?\r\n", names)?,
        })
    }
}

impl HeaderRewriter for StripHeaders {
    fn rewrite(&self, head: Vec<u8>) -> Vec<u8> {
        let mut buf = head;
        for pattern in &self.patterns {
            // Adjacent stripped headers share a CRLF, so one pass is not
            // enough; replace until the pattern no longer matches.
            while pattern.is_match(&buf) {
                buf = pattern.replace_all(&buf, CRLF).into_owned();
            }
        }
        buf
    }
}

/// Removes every header whose name matches none of the patterns. The status
/// line is always retained.
pub struct KeepHeaders {
    patterns: Vec<Regex>,
}

impl KeepHeaders {
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            patterns: compile_patterns(r":.+?\r\n", names)?,
        })
    }
}

impl HeaderRewriter for KeepHeaders {
    fn rewrite(&self, head: Vec<u8>) -> Vec<u8> {
        let mut lines: Vec<Vec<u8>> = split_lines(&head);
        if lines.len() < 3 {
            return head;
        }
        // The final two elements are the empty strings produced by the
        // terminating CRLF CRLF; the first is the status line.
        for index in (1..=lines.len() - 3).rev() {
            let padded = pad_line(&lines[index]);
            let keep = self.patterns.iter().any(|pattern| pattern.is_match(&padded));
            if !keep {
                lines.remove(index);
            }
        }
        join_lines(&lines)
    }
}

/// Rewrites headers matching regex patterns with their paired replacements.
/// A replacement may reference capture groups from its pattern.
pub struct SubstituteHeaders {
    patterns: Vec<Regex>,
    replacements: Vec<Vec<u8>>,
}

impl SubstituteHeaders {
    /// Builds a substituting rewriter from a flat list of pattern and
    /// replacement pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pairs: Vec<String> = pairs.into_iter().map(|s| s.as_ref().to_string()).collect();
        if pairs.len() % 2 != 0 {
            bail!("header substitutions require matching pattern and replacement pairs");
        }
        let mut names = Vec::with_capacity(pairs.len() / 2);
        let mut replacements = Vec::with_capacity(pairs.len() / 2);
        for pair in pairs.chunks(2) {
            names.push(pair[0].clone());
            let mut replacement = pair[1].clone().into_bytes();
            replacement.extend_from_slice(CRLF);
            replacements.push(replacement);
        }
        Ok(Self {
            patterns: compile_patterns(r"\r\n", names)?,
            replacements,
        })
    }
}

impl HeaderRewriter for SubstituteHeaders {
    fn rewrite(&self, head: Vec<u8>) -> Vec<u8> {
        let mut lines: Vec<Vec<u8>> = split_lines(&head);
        if lines.len() < 3 {
            return head;
        }
        for index in 1..=lines.len() - 3 {
            for (pattern, replacement) in self.patterns.iter().zip(&self.replacements) {
                let padded = pad_line(&lines[index]);
                if pattern.is_match(&padded) {
                    let mut replaced = pattern
                        .replace_all(&padded, replacement.as_slice())
                        .into_owned();
                    if replaced.ends_with(CRLF) {
                        replaced.truncate(replaced.len() - CRLF.len());
                    }
                    lines[index] = replaced;
                }
            }
        }
        join_lines(&lines)
    }
}

static TRANSFER_ENCODING: Lazy<StripHeaders> = Lazy::new(|| {
    StripHeaders::new(["Transfer-Encoding"]).expect("static header pattern failed to compile")
});
static CONTENT_LENGTH: Lazy<StripHeaders> = Lazy::new(|| {
    StripHeaders::new(["Content-Length"]).expect("static header pattern failed to compile")
});

/// Applied to every head before user rewriters run: the persisted body is
/// never chunked.
pub(crate) fn strip_transfer_encoding(head: Vec<u8>) -> Vec<u8> {
    TRANSFER_ENCODING.rewrite(head)
}

/// Applied before the transformed body is appended, since the transforms
/// may have changed its length.
pub(crate) fn strip_content_length(head: Vec<u8>) -> Vec<u8> {
    CONTENT_LENGTH.rewrite(head)
}

fn split_lines(buf: &[u8]) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut rest = buf;
    while let Some(index) = rest.windows(2).position(|window| window == CRLF) {
        lines.push(rest[..index].to_vec());
        rest = &rest[index + 2..];
    }
    lines.push(rest.to_vec());
    lines
}

fn join_lines(lines: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (index, line) in lines.iter().enumerate() {
        if index > 0 {
            buf.extend_from_slice(CRLF);
        }
        buf.extend_from_slice(line);
    }
    buf
}

fn pad_line(line: &[u8]) -> Vec<u8> {
    let mut padded = Vec::with_capacity(line.len() + 4);
    padded.extend_from_slice(CRLF);
    padded.extend_from_slice(line);
    padded.extend_from_slice(CRLF);
    padded
}
