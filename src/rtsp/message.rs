//! Control-protocol messages
//!
//! Requests are rendered as newline-separated text:
//!
//! ```text
//! SETUP movie.mp3 RTSP/1.0
//! CSeq: 1
//! Transport: RTP/UDP; client_port= 25000
//! ```
//!
//! Replies start with a status line (`RTSP/1.0 200 OK`) followed by
//! `Name: value` headers. Several replies may arrive in one read and the
//! last one may lack its trailing newline, so the reader splits on status
//! lines rather than on blank lines.

use std::fmt;

/// Protocol tag on request and status lines
pub const RTSP_VERSION: &str = "RTSP/1.0";

const STATUS_PREFIX: &str = "RTSP/";

// ============ Requests ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Setup,
    Play,
    Pause,
    Teardown,
}

impl RequestKind {
    pub fn method(&self) -> &'static str {
        match self {
            RequestKind::Setup => "SETUP",
            RequestKind::Play => "PLAY",
            RequestKind::Pause => "PAUSE",
            RequestKind::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// A request ready to be written to the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub resource: String,
    pub cseq: u32,
    /// Client data-channel port, sent with SETUP
    pub client_port: u16,
    /// Server-assigned session id, sent with everything but SETUP
    pub session_id: u64,
}

impl Request {
    pub fn render(&self) -> String {
        let mut text = format!(
            "{} {} {}\nCSeq: {}\n",
            self.kind.method(),
            self.resource,
            RTSP_VERSION,
            self.cseq
        );
        match self.kind {
            RequestKind::Setup => {
                text.push_str(&format!("Transport: RTP/UDP; client_port= {}\n", self.client_port));
            }
            _ => text.push_str(&format!("Session: {}\n", self.session_id)),
        }
        text
    }
}

// ============ Replies ============

/// Errors from parsing one reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyParseError {
    /// First line is not `RTSP/x.y <code> ...`
    BadStatusLine(String),
    /// A required header is absent
    MissingHeader(&'static str),
    /// A header value is not a number
    BadHeader { name: &'static str, value: String },
}

impl fmt::Display for ReplyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyParseError::BadStatusLine(line) => write!(f, "Bad status line: {:?}", line),
            ReplyParseError::MissingHeader(name) => write!(f, "Missing {} header", name),
            ReplyParseError::BadHeader { name, value } => {
                write!(f, "Bad {} header value: {:?}", name, value)
            }
        }
    }
}

impl std::error::Error for ReplyParseError {}

/// A parsed control-channel reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub reason: String,
    pub cseq: u32,
    /// Absent on some error replies
    pub session_id: Option<u64>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    pub fn parse(text: &str) -> Result<Self, ReplyParseError> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with(STATUS_PREFIX) {
            return Err(ReplyParseError::BadStatusLine(status_line.to_string()));
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| ReplyParseError::BadStatusLine(status_line.to_string()))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        let mut cseq = None;
        let mut session_id = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.trim().eq_ignore_ascii_case("cseq") {
                let n = parse_number("CSeq", value)?;
                let n = u32::try_from(n).map_err(|_| ReplyParseError::BadHeader {
                    name: "CSeq",
                    value: value.to_string(),
                })?;
                cseq = Some(n);
            } else if name.trim().eq_ignore_ascii_case("session") {
                // `Session: 1234;timeout=60`
                let id = value.split(';').next().unwrap_or_default().trim();
                session_id = Some(parse_number("Session", id)?);
            }
        }

        Ok(Self {
            status,
            reason,
            cseq: cseq.ok_or(ReplyParseError::MissingHeader("CSeq"))?,
            session_id,
        })
    }
}

fn parse_number(name: &'static str, value: &str) -> Result<u64, ReplyParseError> {
    value.parse::<u64>().map_err(|_| ReplyParseError::BadHeader {
        name,
        value: value.to_string(),
    })
}

// ============ Framing ============

/// Accumulates control-channel text and yields complete replies
///
/// A reply is complete once the next status line arrives, or at `flush`
/// time (read boundary) if it already carries a CSeq header.
#[derive(Debug, Default)]
pub struct ReplyReader {
    pending: String,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read's worth of text and take every reply it completes
    pub fn push(&mut self, chunk: &str) -> Vec<Result<Reply, ReplyParseError>> {
        self.pending.push_str(chunk);

        let starts = status_line_starts(&self.pending);
        let mut out = Vec::new();
        let mut consumed = 0;

        // Text before the first status line is noise
        if let Some(&first) = starts.first() {
            if first > 0 {
                out.push(Reply::parse(&self.pending[..first]));
            }
            consumed = first;
        }
        for window in starts.windows(2) {
            out.push(Reply::parse(&self.pending[window[0]..window[1]]));
            consumed = window[1];
        }

        // The last reply is done if it is terminated or already has its CSeq
        let tail = &self.pending[consumed..];
        if !tail.trim().is_empty() && is_complete(tail) {
            out.push(Reply::parse(tail));
            consumed = self.pending.len();
        }

        self.pending.drain(..consumed);
        out
    }

    /// Parse whatever is left (used when the peer closes)
    pub fn finish(&mut self) -> Option<Result<Reply, ReplyParseError>> {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() {
            None
        } else {
            Some(Reply::parse(&rest))
        }
    }
}

fn status_line_starts(text: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with(STATUS_PREFIX) {
            starts.push(offset);
        }
        offset += line.len();
    }
    starts
}

/// A tail without a Session header or a blank line stays buffered until the
/// next status line arrives or `finish()` runs on close.
fn is_complete(reply: &str) -> bool {
    let mut has_cseq = false;
    let mut has_session = false;
    for line in reply.lines() {
        if let Some((name, _)) = line.split_once(':') {
            let name = name.trim();
            has_cseq |= name.eq_ignore_ascii_case("cseq");
            has_session |= name.eq_ignore_ascii_case("session");
        }
    }
    has_cseq && (has_session || reply.ends_with("\n\n") || reply.ends_with("\r\n\r\n"))
}
