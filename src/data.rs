//! Data channel plumbing: where bytes come from and go to, and the two
//! wire framings (stream and extended block).
//!
//! Stream mode is a plain byte copy that ends when the sender closes the
//! socket. Extended-block mode frames every block with a 17-byte header
//! (descriptor, byte count, offset), so blocks may arrive out of order and
//! the connection can outlive a single transfer.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, PoisonError};

use crate::attr::Mode;
use crate::restart_marker::Range;

/// Descriptor bit marking the last block of a transfer.
pub const EB_EOD: u8 = 0x08;
/// Descriptor bit announcing that the count field holds the EOD count.
pub const EB_EOF: u8 = 0x40;
pub const EB_HEADER_LEN: usize = 17;
/// Payload size used when sending.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Destination for retrieved data. Blocks may arrive out of order.
pub trait DataSink: Send {
    fn write_block(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
}

impl<T: Write + Seek + Send> DataSink for T {
    fn write_block(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)
    }
}

/// Origin of stored data.
pub trait DataSource: Send {
    /// Fills `buf` from `offset`; returns 0 at end of data.
    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read + Seek + Send> DataSource for T {
    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        self.read(buf)
    }
}

/// Sinks and sources outlive a single attempt, so restarts write into the
/// same place.
pub type SharedSink = Arc<Mutex<dyn DataSink>>;
pub type SharedSource = Arc<Mutex<dyn DataSource>>;

pub fn shared_sink<S: DataSink + 'static>(sink: S) -> SharedSink {
    Arc::new(Mutex::new(sink))
}

pub fn shared_source<S: DataSource + 'static>(source: S) -> SharedSource {
    Arc::new(Mutex::new(source))
}

/// One block as reported to the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: u64,
    pub length: u64,
    /// Line feeds in the payload; an ASCII transfer sends each as CRLF.
    pub newlines: u64,
    pub eof: bool,
}

impl Block {
    pub fn payload(offset: u64, data: &[u8]) -> Block {
        Block {
            offset,
            length: data.len() as u64,
            newlines: data.iter().filter(|&&b| b == b'\n').count() as u64,
            eof: false,
        }
    }

    pub fn end_of_data(offset: u64) -> Block {
        Block {
            offset,
            length: 0,
            newlines: 0,
            eof: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EbHeader {
    pub descriptor: u8,
    pub count: u64,
    pub offset: u64,
}

impl EbHeader {
    pub fn is_eod(&self) -> bool {
        self.descriptor & EB_EOD != 0
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = [0u8; EB_HEADER_LEN];
        buf[0] = self.descriptor;
        buf[1..9].copy_from_slice(&self.count.to_be_bytes());
        buf[9..17].copy_from_slice(&self.offset.to_be_bytes());
        w.write_all(&buf)
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<EbHeader> {
        let mut buf = [0u8; EB_HEADER_LEN];
        r.read_exact(&mut buf)?;
        let mut count = [0u8; 8];
        let mut offset = [0u8; 8];
        count.copy_from_slice(&buf[1..9]);
        offset.copy_from_slice(&buf[9..17]);
        Ok(EbHeader {
            descriptor: buf[0],
            count: u64::from_be_bytes(count),
            offset: u64::from_be_bytes(offset),
        })
    }
}

/// Drains a data connection into `sink`.
///
/// Stream data is written sequentially from `base_offset`. Extended-block
/// offsets are absolute. Returns the number of payload bytes received.
pub fn receive<R: Read>(
    conn: &mut R,
    mode: Mode,
    sink: &SharedSink,
    base_offset: u64,
    on_block: &mut dyn FnMut(Block),
) -> io::Result<u64> {
    match mode {
        Mode::Stream => receive_stream(conn, sink, base_offset, on_block),
        Mode::ExtendedBlock => receive_eb(conn, sink, on_block),
    }
}

fn receive_stream<R: Read>(
    conn: &mut R,
    sink: &SharedSink,
    base_offset: u64,
    on_block: &mut dyn FnMut(Block),
) -> io::Result<u64> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut offset = base_offset;
    loop {
        let n = match conn.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_block(offset, &buf[..n])?;
        on_block(Block::payload(offset, &buf[..n]));
        offset += n as u64;
    }
    on_block(Block::end_of_data(offset));
    Ok(offset - base_offset)
}

fn receive_eb<R: Read>(
    conn: &mut R,
    sink: &SharedSink,
    on_block: &mut dyn FnMut(Block),
) -> io::Result<u64> {
    let mut total = 0u64;
    // payloads pass through this buffer whatever count the header claims
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let header = EbHeader::read_from(conn)?;
        // an EOF descriptor carries the EOD count, not a payload length
        let payload = if header.descriptor & EB_EOF != 0 { 0 } else { header.count };
        if header.offset.checked_add(payload).is_none() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "block past end of file"));
        }
        let mut done = 0u64;
        while done < payload {
            let n = (payload - done).min(BLOCK_SIZE as u64) as usize;
            conn.read_exact(&mut buf[..n])?;
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_block(header.offset + done, &buf[..n])?;
            done += n as u64;
        }
        total += payload;
        let eof = header.is_eod();
        if payload > 0 || eof {
            on_block(Block {
                offset: header.offset,
                length: payload,
                newlines: 0,
                eof,
            });
        }
        if eof {
            return Ok(total);
        }
    }
}

/// Pumps `source` onto a data connection.
///
/// Sends from `base_offset` up to `end` (or the end of the source), skipping
/// any range listed in `skip`. Stream mode ignores `skip`. Returns the
/// number of payload bytes sent.
pub fn send<W: Write>(
    conn: &mut W,
    mode: Mode,
    source: &SharedSource,
    base_offset: u64,
    end: Option<u64>,
    skip: &[Range],
    on_block: &mut dyn FnMut(Block),
) -> io::Result<u64> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut offset = base_offset;
    let mut total = 0u64;
    loop {
        if mode == Mode::ExtendedBlock {
            if let Some(r) = skip.iter().find(|r| r.start <= offset && offset <= r.end) {
                match r.end.checked_add(1) {
                    Some(next) => offset = next,
                    None => break,
                }
                continue;
            }
        }
        let mut want = buf.len() as u64;
        if let Some(end) = end {
            if offset >= end {
                break;
            }
            want = want.min(end - offset);
        }
        if mode == Mode::ExtendedBlock {
            if let Some(next) = skip.iter().filter(|r| r.start > offset).map(|r| r.start).min() {
                want = want.min(next - offset);
            }
        }
        let want = want as usize;
        let n = source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read_block(offset, &mut buf[..want])?;
        if n == 0 {
            break;
        }
        match mode {
            Mode::Stream => conn.write_all(&buf[..n])?,
            Mode::ExtendedBlock => {
                EbHeader {
                    descriptor: 0,
                    count: n as u64,
                    offset,
                }
                .write_to(conn)?;
                conn.write_all(&buf[..n])?;
            }
        }
        on_block(Block::payload(offset, &buf[..n]));
        offset += n as u64;
        total += n as u64;
    }
    if mode == Mode::ExtendedBlock {
        EbHeader {
            descriptor: EB_EOD,
            count: 0,
            offset: 0,
        }
        .write_to(conn)?;
    }
    conn.flush()?;
    on_block(Block::end_of_data(offset));
    Ok(total)
}
