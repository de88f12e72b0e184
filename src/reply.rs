//! Control-channel replies and the parsers that pull values out of them.

use std::io::{self, BufRead};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::restart_marker::RestartMarker;

static PASV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})")
        .expect("valid PASV pattern")
});

static QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""((?:[^"]|"")*)""#).expect("valid quote pattern"));

/// Reply class, taken from the first digit of the reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    Preliminary,
    Completion,
    Intermediate,
    TransientNegative,
    PermanentNegative,
    Unknown,
}

/// One complete (possibly multi-line) reply from a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u32,
    /// Raw reply text, lines joined with `\n`, codes included.
    pub text: String,
}

impl Reply {
    pub fn new(code: u32, text: impl Into<String>) -> Self {
        Reply {
            code,
            text: text.into(),
        }
    }

    pub fn from_response(resp: &suppaftp::types::Response) -> Self {
        let text = String::from_utf8_lossy(&resp.body).trim_end().to_string();
        Reply::new(resp.status.code(), text)
    }

    pub fn class(&self) -> ReplyClass {
        match self.code / 100 {
            1 => ReplyClass::Preliminary,
            2 => ReplyClass::Completion,
            3 => ReplyClass::Intermediate,
            4 => ReplyClass::TransientNegative,
            5 => ReplyClass::PermanentNegative,
            _ => ReplyClass::Unknown,
        }
    }

    pub fn is_preliminary(&self) -> bool {
        self.class() == ReplyClass::Preliminary
    }

    pub fn is_completion(&self) -> bool {
        self.class() == ReplyClass::Completion
    }

    /// Reply text with the leading code of the first line removed.
    pub fn message(&self) -> &str {
        strip_code(&self.text).trim_end()
    }

    /// Body lines with any `NNN-` / `NNN ` prefix stripped.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines().map(strip_code)
    }
}

fn strip_code(line: &str) -> &str {
    let bytes = line.as_bytes();
    if bytes.len() >= 4
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && (bytes[3] == b' ' || bytes[3] == b'-')
    {
        &line[4..]
    } else if bytes.len() == 3 && bytes.iter().all(u8::is_ascii_digit) {
        ""
    } else {
        line
    }
}

/// Reads one reply from a line-oriented control stream.
///
/// Handles the `NNN-` continuation form: lines are collected until a line
/// starting with the same code followed by a space.
pub fn read_reply<R: BufRead>(reader: &mut R) -> io::Result<Reply> {
    let mut first = String::new();
    if reader.read_line(&mut first)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "control connection closed",
        ));
    }
    let first = first.trim_end_matches(&['\r', '\n'][..]).to_string();
    let code = parse_code(&first)?;
    let mut text = first.clone();
    if first.as_bytes().get(3) == Some(&b'-') {
        let terminator = format!("{} ", &first[..3]);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "control connection closed inside a multi-line reply",
                ));
            }
            let line = line.trim_end_matches(&['\r', '\n'][..]);
            text.push('\n');
            text.push_str(line);
            if line.starts_with(&terminator) || line == &first[..3] {
                break;
            }
        }
    }
    Ok(Reply::new(code, text))
}

fn parse_code(line: &str) -> io::Result<u32> {
    line.get(..3)
        .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed reply line: {:?}", line),
            )
        })
}

/// Extracts the data-channel address from a `227` reply.
pub fn parse_pasv(reply: &Reply) -> Option<SocketAddr> {
    let caps = PASV_RE.captures(&reply.text)?;
    let mut nums = [0u8; 6];
    for (i, slot) in nums.iter_mut().enumerate() {
        *slot = caps.get(i + 1)?.as_str().parse().ok()?;
    }
    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = u16::from(nums[4]) << 8 | u16::from(nums[5]);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Renders an address in the `h1,h2,h3,h4,p1,p2` form used by `PORT`.
pub fn format_host_port(addr: &SocketAddr) -> Option<String> {
    match addr {
        SocketAddr::V4(v4) => {
            let o = v4.ip().octets();
            let port = v4.port();
            Some(format!(
                "{},{},{},{},{},{}",
                o[0],
                o[1],
                o[2],
                o[3],
                port >> 8,
                port & 0xff
            ))
        }
        SocketAddr::V6(_) => None,
    }
}

pub fn parse_size(reply: &Reply) -> Option<u64> {
    if reply.code != 213 {
        return None;
    }
    reply.message().trim().parse().ok()
}

/// `213 YYYYMMDDhhmmss[.sss]`
pub fn parse_mdtm(reply: &Reply) -> Option<DateTime<Utc>> {
    if reply.code != 213 {
        return None;
    }
    let stamp = reply.message().trim();
    let whole = stamp.split('.').next()?;
    if whole.len() != 14 {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").ok()?;
    Some(naive.and_utc())
}

pub fn parse_cksm(reply: &Reply) -> Option<String> {
    if reply.code != 213 {
        return None;
    }
    let sum = reply.message().trim();
    (!sum.is_empty()).then(|| sum.to_string())
}

/// Returns the fact line of a `250-` MLST reply.
pub fn parse_mlst(reply: &Reply) -> Option<String> {
    if reply.code != 250 {
        return None;
    }
    reply
        .text
        .lines()
        .skip(1)
        .find(|l| l.starts_with(' '))
        .map(|l| l.trim_start().to_string())
        .or_else(|| {
            reply
                .text
                .lines()
                .nth(1)
                .filter(|l| !l.starts_with("250"))
                .map(|l| l.trim().to_string())
        })
}

/// Working directory reported by a `250` reply to CWD, if quoted.
pub fn parse_cwd(reply: &Reply) -> Option<String> {
    let caps = QUOTED_RE.captures(reply.message())?;
    Some(caps.get(1)?.as_str().replace("\"\"", "\""))
}

/// STAT output without the framing code lines.
pub fn parse_stat(reply: &Reply) -> String {
    let lines: Vec<&str> = reply.text.lines().collect();
    if lines.len() <= 1 {
        return reply.message().to_string();
    }
    let mut body = String::new();
    for line in &lines[1..lines.len() - 1] {
        body.push_str(line.trim_start());
        body.push('\n');
    }
    body
}

/// Parses a `111 Range Marker a-b,c-d` preliminary reply.
pub fn parse_restart_marker(reply: &Reply) -> Option<RestartMarker> {
    if reply.code != 111 {
        return None;
    }
    let message = reply.message();
    let ranges = message
        .strip_prefix("Range Marker")
        .map(str::trim)
        .unwrap_or_else(|| message.trim());
    RestartMarker::from_string(ranges).ok()
}
