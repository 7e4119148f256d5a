// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! The GlobalPlatform Admin HTTP envelope (GPC_SPE_011 §3.4, spec §4.5).
//!
//! This module only knows how to parse/emit the envelope shape over an
//! already-established byte stream (the PSK-TLS connection lives in
//! `scp81-server`); it never touches sockets directly.

use std::collections::BTreeMap;

use crate::error::Error;
use crate::session::ScriptStatus;

pub const ADMIN_PROTOCOL: &str = "globalplatform-remote-admin/1.0";
pub const CONTENT_TYPE_CLIENT: &str = "application/vnd.globalplatform.card-content-mgt-response;version=1.0";
pub const CONTENT_TYPE_SERVER: &str = "application/vnd.globalplatform.card-content-mgt;version=1.0";

const HDR_PROTOCOL: &str = "x-admin-protocol";
const HDR_NEXT_URI: &str = "x-admin-next-uri";
const HDR_TARGETED_APPLICATION: &str = "x-admin-targeted-application";
const HDR_FROM: &str = "x-admin-from";
const HDR_SCRIPT_STATUS: &str = "x-admin-script-status";
const HDR_RESUME: &str = "x-admin-resume";

/// A parsed client → server Admin HTTP request.
#[derive(Clone, Debug, PartialEq)]
pub struct AdminRequest {
    pub path: String,
    pub from: Option<String>,
    pub script_status: Option<ScriptStatus>,
    pub resume: bool,
    pub body: Vec<u8>,
}

/// A server → client Admin HTTP response.
#[derive(Clone, Debug, PartialEq)]
pub struct AdminResponse {
    /// 200 when C-APDUs follow, 204 when the script is complete.
    pub status: u16,
    pub next_uri: Option<String>,
    pub targeted_application: Option<Vec<u8>>,
    pub body: Vec<u8>,
}

impl AdminResponse {
    pub fn continue_with(next_uri: impl Into<String>, body: Vec<u8>) -> Self {
        Self { status: 200, next_uri: Some(next_uri.into()), targeted_application: None, body }
    }

    pub fn done() -> Self {
        Self { status: 204, next_uri: None, targeted_application: None, body: Vec::new() }
    }

    /// Deterministic header order, CRLF line endings, exact
    /// `Content-Length`, never chunked (spec §4.5 "Emitter" rules).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let reason = if self.status == 204 { "No Content" } else { "OK" };
        out.extend_from_slice(format!("HTTP/1.1 {} {reason}\r\n", self.status).as_bytes());
        out.extend_from_slice(format!("Content-Type: {CONTENT_TYPE_SERVER}\r\n").as_bytes());
        out.extend_from_slice(format!("X-Admin-Protocol: {ADMIN_PROTOCOL}\r\n").as_bytes());
        if let Some(uri) = &self.next_uri {
            out.extend_from_slice(format!("X-Admin-Next-URI: {uri}\r\n").as_bytes());
        }
        if let Some(aid) = &self.targeted_application {
            out.extend_from_slice(format!("X-Admin-Targeted-Application: {}\r\n", hex::encode_upper(aid)).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Parse a client request from a complete byte buffer (start line,
/// headers, and exactly `Content-Length` body bytes already available).
pub fn parse_request(buf: &[u8]) -> Result<AdminRequest, Error> {
    let header_end = find_header_end(buf)
        .ok_or_else(|| Error::Protocol("request missing blank line terminating headers".into()))?;
    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| Error::Protocol("request headers are not valid UTF-8".into()))?;

    let mut lines = head.split("\r\n");
    let start_line = lines.next().unwrap_or_default();
    let mut parts = start_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default().to_string();
    if method != "POST" {
        return Err(Error::Protocol(format!("unsupported method {method:?}")));
    }

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("malformed header line {line:?}")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    match headers.get(HDR_PROTOCOL) {
        Some(v) if v == ADMIN_PROTOCOL => {}
        _ => return Err(Error::Protocol("missing or mismatched X-Admin-Protocol".into())),
    }

    let content_type = headers.get("content-type").cloned().unwrap_or_default();
    if content_type.split(';').next().unwrap_or("").trim() != CONTENT_TYPE_CLIENT.split(';').next().unwrap() {
        return Err(Error::UnsupportedMediaType(format!("unsupported Content-Type {content_type:?}")));
    }

    let content_length: usize = headers
        .get("content-length")
        .ok_or_else(|| Error::Protocol("missing Content-Length".into()))?
        .parse()
        .map_err(|_| Error::Protocol("Content-Length is not a number".into()))?;

    let body_start = header_end + 4;
    let body = buf
        .get(body_start..body_start + content_length)
        .ok_or_else(|| Error::Protocol("body shorter than Content-Length".into()))?
        .to_vec();

    let script_status = match headers.get(HDR_SCRIPT_STATUS) {
        Some(v) => Some(
            v.parse::<ScriptStatus>()
                .map_err(|_| Error::Protocol(format!("unrecognized X-Admin-Script-Status {v:?}")))?,
        ),
        None => None,
    };

    Ok(AdminRequest {
        path,
        from: headers.get(HDR_FROM).cloned(),
        script_status,
        resume: headers.get(HDR_RESUME).is_some_and(|v| v.eq_ignore_ascii_case("true")),
        body,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse a server response from a complete byte buffer (the simulator's
/// half of the envelope exchange, dual of [`parse_request`]).
pub fn parse_response(buf: &[u8]) -> Result<AdminResponse, Error> {
    let header_end = find_header_end(buf)
        .ok_or_else(|| Error::Protocol("response missing blank line terminating headers".into()))?;
    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| Error::Protocol("response headers are not valid UTF-8".into()))?;

    let mut lines = head.split("\r\n");
    let start_line = lines.next().unwrap_or_default();
    let status: u16 = start_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("malformed status line {start_line:?}")))?;

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("malformed header line {line:?}")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    match headers.get(HDR_PROTOCOL) {
        Some(v) if v == ADMIN_PROTOCOL => {}
        _ => return Err(Error::Protocol("missing or mismatched X-Admin-Protocol".into())),
    }

    let content_length: usize = headers
        .get("content-length")
        .ok_or_else(|| Error::Protocol("missing Content-Length".into()))?
        .parse()
        .map_err(|_| Error::Protocol("Content-Length is not a number".into()))?;

    let body_start = header_end + 4;
    let body = buf
        .get(body_start..body_start + content_length)
        .ok_or_else(|| Error::Protocol("body shorter than Content-Length".into()))?
        .to_vec();

    let targeted_application = match headers.get(HDR_TARGETED_APPLICATION) {
        Some(v) => Some(hex::decode(v).map_err(|_| Error::Protocol("malformed X-Admin-Targeted-Application".into()))?),
        None => None,
    };

    Ok(AdminResponse { status, next_uri: headers.get(HDR_NEXT_URI).cloned(), targeted_application, body })
}

/// A bare HTTP status-line response with no body, for the protocol
/// failures spec §4.5/§4.6 name (`400` malformed envelope or URI reuse,
/// `404` unknown/resume next-URI, `415` unsupported Content-Type) that
/// precede any Admin envelope semantics and so can't go through
/// [`AdminResponse`].
pub fn encode_status_only(status: u16) -> Vec<u8> {
    let reason = match status {
        400 => "Bad Request",
        404 => "Not Found",
        415 => "Unsupported Media Type",
        _ => "Error",
    };
    format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\n\r\n").into_bytes()
}

/// Build the client-side request envelope bytes (used by the simulator,
/// the dual of [`parse_request`]/[`AdminResponse::encode`]).
pub fn encode_request(
    path: &str,
    from: &str,
    script_status: Option<ScriptStatus>,
    resume: bool,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("POST {path} HTTP/1.1\r\n").as_bytes());
    out.extend_from_slice(format!("Content-Type: {CONTENT_TYPE_CLIENT}\r\n").as_bytes());
    out.extend_from_slice(format!("X-Admin-Protocol: {ADMIN_PROTOCOL}\r\n").as_bytes());
    out.extend_from_slice(format!("X-Admin-From: {from}\r\n").as_bytes());
    if let Some(status) = script_status {
        out.extend_from_slice(format!("X-Admin-Script-Status: {status}\r\n").as_bytes());
    }
    if resume {
        out.extend_from_slice(b"X-Admin-Resume: true\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}
