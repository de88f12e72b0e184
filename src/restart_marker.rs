//! Restart markers: where to resume an interrupted transfer.
//!
//! A marker is either empty, a single stream-mode offset, or a sorted set
//! of disjoint byte ranges collected in extended-block mode. The text form
//! is what goes on the wire after `REST` and what callers persist between
//! runs: a bare integer for stream offsets, `start-end,start-end` for
//! ranges. Ranges are inclusive at both ends, so `0-9` covers ten bytes
//! and `0-9,10-19` is the same marker as `0-19`. A stream marker whose
//! ASCII offset differs from the binary one is written `offset:ascii`;
//! [`RestartMarker::wire_marker`] gives the form `REST` carries.

use std::fmt;

use crate::error::ClientError;

/// One acknowledged byte range, `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

/// A resumable position within a transfer.
#[derive(Debug, Clone, Eq, Default)]
pub enum RestartMarker {
    #[default]
    None,
    Stream {
        offset: u64,
        ascii_offset: u64,
    },
    ExtendedBlock(Vec<Range>),
}

impl RestartMarker {
    pub fn new() -> Self {
        RestartMarker::None
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RestartMarker::None => true,
            RestartMarker::Stream { .. } => false,
            RestartMarker::ExtendedBlock(ranges) => ranges.is_empty(),
        }
    }

    /// Makes this a stream marker at `offset` (binary and ASCII alike).
    pub fn set_offset(&mut self, offset: u64) {
        *self = RestartMarker::Stream {
            offset,
            ascii_offset: offset,
        };
    }

    /// Stream marker where the ASCII-converted offset differs from the
    /// binary one.
    pub fn set_ascii_offset(&mut self, offset: u64, ascii_offset: u64) {
        *self = RestartMarker::Stream {
            offset,
            ascii_offset,
        };
    }

    /// Adds `start..=end` to an extended-block marker, merging with any
    /// range it overlaps or directly follows.
    ///
    /// An empty marker becomes an extended-block marker. A stream marker
    /// can't take ranges.
    pub fn insert_range(&mut self, start: u64, end: u64) -> Result<(), ClientError> {
        if end < start {
            return Err(ClientError::InvalidParameter("end"));
        }
        if let RestartMarker::None = self {
            *self = RestartMarker::ExtendedBlock(Vec::new());
        }
        let ranges = match self {
            RestartMarker::ExtendedBlock(ranges) => ranges,
            _ => return Err(ClientError::InvalidParameter("marker")),
        };

        let mut merged = Range { start, end };
        let mut out = Vec::with_capacity(ranges.len() + 1);
        let mut placed = false;
        for r in ranges.drain(..) {
            if r.end.saturating_add(1) < merged.start {
                out.push(r);
            } else if merged.end.saturating_add(1) < r.start {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(r);
            } else {
                merged.start = merged.start.min(r.start);
                merged.end = merged.end.max(r.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        *ranges = out;
        Ok(())
    }

    /// Ranges of an extended-block marker, empty otherwise.
    pub fn ranges(&self) -> &[Range] {
        match self {
            RestartMarker::ExtendedBlock(ranges) => ranges,
            _ => &[],
        }
    }

    /// Number of bytes the marker says are already done.
    pub fn total(&self) -> u64 {
        match self {
            RestartMarker::None => 0,
            RestartMarker::Stream { offset, .. } => *offset,
            RestartMarker::ExtendedBlock(ranges) => ranges.iter().map(|r| r.end - r.start + 1).sum(),
        }
    }

    /// Start and length of the first contiguous block from offset 0.
    pub fn first_block(&self) -> (u64, u64) {
        match self {
            RestartMarker::None => (0, 0),
            RestartMarker::Stream { offset, .. } => (0, *offset),
            RestartMarker::ExtendedBlock(ranges) => match ranges.first() {
                Some(r) => (r.start, r.end - r.start + 1),
                None => (0, 0),
            },
        }
    }

    /// Stream offset to resume from, choosing the ASCII one for ASCII
    /// transfers.
    pub fn stream_offset(&self, ascii: bool) -> Option<u64> {
        match self {
            RestartMarker::Stream {
                offset,
                ascii_offset,
            } => Some(if ascii { *ascii_offset } else { *offset }),
            _ => None,
        }
    }

    /// The marker as `REST` sends it: ASCII transfers resume from the
    /// ASCII offset, everything else is unchanged.
    pub fn wire_marker(&self, ascii: bool) -> RestartMarker {
        match self.stream_offset(ascii) {
            Some(offset) => RestartMarker::Stream {
                offset,
                ascii_offset: offset,
            },
            None => self.clone(),
        }
    }

    /// Parses the text form produced by `to_string`.
    pub fn from_string(text: &str) -> Result<Self, ClientError> {
        let number = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| ClientError::InvalidParameter("marker_string"))
        };
        let text = text.trim();
        if text.is_empty() {
            return Ok(RestartMarker::None);
        }
        if !text.contains('-') {
            let (offset, ascii_offset) = match text.split_once(':') {
                Some((offset, ascii)) => (number(offset)?, number(ascii)?),
                None => (number(text)?, number(text)?),
            };
            return Ok(RestartMarker::Stream {
                offset,
                ascii_offset,
            });
        }
        let mut marker = RestartMarker::ExtendedBlock(Vec::new());
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (start, end) = part
                .split_once('-')
                .ok_or(ClientError::InvalidParameter("marker_string"))?;
            marker.insert_range(number(start)?, number(end)?)?;
        }
        if marker.is_empty() {
            return Ok(RestartMarker::None);
        }
        Ok(marker)
    }
}

/// An extended-block marker with no ranges is the empty marker.
impl PartialEq for RestartMarker {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                RestartMarker::Stream {
                    offset: a,
                    ascii_offset: a_ascii,
                },
                RestartMarker::Stream {
                    offset: b,
                    ascii_offset: b_ascii,
                },
            ) => a == b && a_ascii == b_ascii,
            (RestartMarker::ExtendedBlock(a), RestartMarker::ExtendedBlock(b)) => a == b,
            _ => self.is_empty() && other.is_empty(),
        }
    }
}

impl fmt::Display for RestartMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartMarker::None => Ok(()),
            RestartMarker::Stream {
                offset,
                ascii_offset,
            } if ascii_offset != offset => write!(f, "{}:{}", offset, ascii_offset),
            RestartMarker::Stream { offset, .. } => write!(f, "{}", offset),
            RestartMarker::ExtendedBlock(ranges) => {
                for (i, r) in ranges.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}-{}", r.start, r.end)?;
                }
                Ok(())
            }
        }
    }
}
