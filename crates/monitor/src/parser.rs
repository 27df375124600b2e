//! Access-log line parsing and tunnel attribution.
//!
//! The static server writes one line per response:
//!
//! ```text
//! 203.0.113.9 - - [02/Aug/2026:10:00:00 +0000] "GET /download-file/a1b2c3d4/a.txt HTTP/1.1" 200 12500 12288 "curl/8.0.1" 0.123 req-8f14e45f
//! ```
//!
//! Fields after the request line: status, total bytes sent, body bytes sent,
//! quoted user agent, request time in seconds, request ID. Lines that do not
//! fit are dropped by the caller and counted.

use chrono::{DateTime, Utc};

const TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// One parsed access-log line
#[derive(Debug, Clone, PartialEq)]
pub struct AccessLogEvent {
    pub timestamp: DateTime<Utc>,
    pub remote_addr: String,
    pub method: String,
    /// Request path including any query string
    pub path: String,
    pub status_code: u16,
    pub body_bytes_sent: u64,
    pub user_agent: String,
    pub request_time: f64,
    pub request_id: String,
}

/// Which route family a path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// `/download-file/<id>/…` — the attachment download, counts bytes
    Download,
    /// `/files/<id>/…` — the courtesy page, activity only
    Courtesy,
}

impl AccessLogEvent {
    /// Attribute this event to a tunnel, if its path matches either route.
    pub fn tunnel_route(&self) -> Option<(RouteKind, &str)> {
        let path = self.path.split('?').next().unwrap_or(&self.path);
        let (kind, rest) = if let Some(rest) = path.strip_prefix("/download-file/") {
            (RouteKind::Download, rest)
        } else if let Some(rest) = path.strip_prefix("/files/") {
            (RouteKind::Courtesy, rest)
        } else {
            return None;
        };
        let id = rest.split('/').next().unwrap_or(rest);
        if id.len() == 8 && id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Some((kind, id))
        } else {
            None
        }
    }

    /// Successful download statuses that carry file bytes
    pub fn carries_bytes(&self) -> bool {
        matches!(self.status_code, 200 | 206)
    }
}

/// Parse one log line. `None` means the line is malformed.
pub fn parse_line(line: &str) -> Option<AccessLogEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let remote_addr = line.split_whitespace().next()?.to_string();

    let ts_start = line.find('[')? + 1;
    let ts_end = line[ts_start..].find(']')? + ts_start;
    let timestamp = DateTime::parse_from_str(&line[ts_start..ts_end], TIME_FORMAT)
        .ok()?
        .with_timezone(&Utc);

    let (request, after_request) = quoted(&line[ts_end + 1..])?;
    let mut request_parts = request.split(' ');
    let method = request_parts.next()?.to_string();
    let path = request_parts.next()?.to_string();

    let mut tail = after_request.split_whitespace();
    let status_code: u16 = tail.next()?.parse().ok()?;
    let _bytes_sent: u64 = tail.next()?.parse().ok()?;
    let body_bytes_sent: u64 = tail.next()?.parse().ok()?;

    let (user_agent, after_agent) = quoted(after_request)?;
    let mut tail = after_agent.split_whitespace();
    let request_time: f64 = tail.next()?.parse().ok()?;
    let request_id = tail.next()?.to_string();

    Some(AccessLogEvent {
        timestamp,
        remote_addr,
        method,
        path,
        status_code,
        body_bytes_sent,
        user_agent,
        request_time,
        request_id,
    })
}

/// First double-quoted segment of `text` and the remainder after it.
fn quoted(text: &str) -> Option<(String, &str)> {
    let start = text.find('"')? + 1;
    let end = text[start..].find('"')? + start;
    Some((text[start..end].to_string(), &text[end + 1..]))
}
