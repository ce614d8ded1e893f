use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

use crate::{Request, Response};

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const CRLF_CRLF: &[u8] = b"\r\n\r\n";

/// Head emitted when rehydrating an artifact whose original head was
/// discarded at store time.
pub(crate) const SYNTHETIC_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Renders the response head in wire form: status line, header block, and
/// the terminating blank line. Header names use the lower-case spelling the
/// `http` crate normalizes to.
pub fn dump_head(status: StatusCode, version: Version, headers: &HeaderMap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(version_token(version).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status.as_str().as_bytes());
    if let Some(reason) = status.canonical_reason() {
        buf.push(b' ');
        buf.extend_from_slice(reason.as_bytes());
    }
    buf.extend_from_slice(CRLF);
    for (name, value) in headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(CRLF);
    }
    buf.extend_from_slice(CRLF);
    buf
}

/// Returns the offset of the first byte after the header/body boundary.
pub fn body_offset(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == CRLF_CRLF)
        .map(|index| index + 4)
}

/// Parses a wire-form payload back into a response. The payload must carry
/// a header/body boundary; everything after it becomes the body verbatim.
pub fn parse_response(buf: &[u8]) -> Result<Response> {
    let body_start =
        body_offset(buf).ok_or_else(|| anyhow!("payload missing header/body boundary"))?;
    let head = &buf[..body_start - CRLF_CRLF.len()];

    let mut lines = split_crlf(head);
    let status_line = lines
        .next()
        .ok_or_else(|| anyhow!("payload missing status line"))?;
    let status_line = std::str::from_utf8(status_line).context("status line is not UTF-8")?;
    let (version, status) = parse_status_line(status_line)?;

    let mut response = Response::new(Bytes::copy_from_slice(&buf[body_start..]));
    *response.status_mut() = status;
    *response.version_mut() = version;
    let headers = response.headers_mut();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| anyhow!("header line missing ':' separator"))?;
        let name = trim_ascii(&line[..colon]);
        let value = trim_ascii(&line[colon + 1..]);
        let name = http::header::HeaderName::from_bytes(name)
            .with_context(|| format!("invalid header name {:?}", String::from_utf8_lossy(name)))?;
        let value = http::HeaderValue::from_bytes(value).context("invalid header value")?;
        headers.append(name, value);
    }
    Ok(response)
}

/// Parses an HTTP/1 status line into its version and status code.
pub fn parse_status_line(line: &str) -> Result<(Version, StatusCode)> {
    let mut parts = line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("status line missing status code"))?;

    let version = match version {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/2.0" | "HTTP/2" => Version::HTTP_2,
        "HTTP/3.0" | "HTTP/3" => Version::HTTP_3,
        other => bail!("unsupported HTTP version '{other}'"),
    };
    let code: u16 = status
        .parse()
        .with_context(|| format!("invalid status code '{status}'"))?;
    let status =
        StatusCode::from_u16(code).map_err(|_| anyhow!("unsupported status code '{code}'"))?;
    Ok((version, status))
}

/// `http::Request` is not `Clone`; the retry loop hands the transport a
/// fresh copy per fetch. Extensions are intentionally not carried over.
pub fn clone_request(req: &Request) -> Request {
    let mut clone = Request::new(req.body().clone());
    *clone.method_mut() = req.method().clone();
    *clone.uri_mut() = req.uri().clone();
    *clone.version_mut() = req.version();
    *clone.headers_mut() = req.headers().clone();
    clone
}

fn version_token(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn split_crlf(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = Some(buf);
    std::iter::from_fn(move || {
        let current = rest.take()?;
        match current.windows(2).position(|window| window == CRLF) {
            Some(index) => {
                rest = Some(&current[index + 2..]);
                Some(&current[..index])
            }
            None => Some(current),
        }
    })
}

fn trim_ascii(buf: &[u8]) -> &[u8] {
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
