// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Own the UART to the PMC and frame its byte stream.
// Author: Lukas Bower

//! Serial link to the PMC.
//!
//! The PMC hangs off a 9600-8N1 UART with no flow control. The link is
//! split into a read half consumed by the engine's reader thread and a
//! write half shared by command issuers. Reads are framed at the carriage
//! return; writes emit one complete frame per call.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::debug;
use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::error::{Result, WdHwError};
use crate::pmc::frame::{self, Frame};

/// Default UART device on the supported appliances.
pub const DEFAULT_PORT: &str = "/dev/ttyS0";

const BAUD_RATE: u32 = 9600;

/// Poll granularity of the blocking read side. Short enough that the reader
/// thread notices shutdown promptly.
pub const READ_POLL: Duration = Duration::from_millis(250);

const WRITE_RETRY_LIMIT: u32 = 8;

/// Open the PMC UART and split it into read and write halves.
pub fn open(port_name: &str) -> Result<(impl Read + Send, impl Write + Send)> {
    let port = serialport::new(port_name, BAUD_RATE)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_POLL)
        .open()
        .map_err(|e| {
            WdHwError::LinkIo(io::Error::new(
                io::ErrorKind::Other,
                format!("cannot open {port_name}: {e}"),
            ))
        })?;
    let writer = port
        .try_clone()
        .map_err(|e| WdHwError::LinkIo(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
    debug!("opened PMC link on {port_name} at {BAUD_RATE} baud");
    Ok((port, writer))
}

/// Outcome of a single poll of the read half.
pub enum ReadEvent {
    /// A complete, non-empty frame arrived.
    Frame(Frame),
    /// The poll interval elapsed without completing a frame.
    Idle,
    /// The peer closed the stream.
    Closed,
}

/// Accumulates bytes from the read half into CR-terminated frames.
pub struct FrameReader<R: Read> {
    src: R,
    pending: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap the read half of the link.
    pub fn new(src: R) -> Self {
        Self {
            src,
            pending: Vec::with_capacity(64),
        }
    }

    /// Block until a frame completes, the poll interval elapses, or the
    /// stream ends. Empty frames are swallowed here.
    pub fn next(&mut self) -> Result<ReadEvent> {
        let mut byte = [0u8; 1];
        loop {
            match self.src.read(&mut byte) {
                Ok(0) => return Ok(ReadEvent::Closed),
                Ok(_) => {
                    if byte[0] == frame::TERMINATOR {
                        let raw = std::mem::take(&mut self.pending);
                        if let Some(decoded) = frame::decode(&raw) {
                            return Ok(ReadEvent::Frame(decoded));
                        }
                    } else {
                        self.pending.push(byte[0]);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    return Ok(ReadEvent::Idle);
                }
                Err(e) => return Err(WdHwError::LinkIo(e)),
            }
        }
    }
}

/// Write half of the link. One frame per call, terminator included.
pub struct FrameWriter<W: Write> {
    sink: W,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap the write half of the link.
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    /// Encode and transmit one frame, retrying partial and timed-out writes.
    pub fn write_frame(&mut self, code: &str, value: Option<&str>) -> Result<()> {
        let bytes = frame::encode(code, value);
        let mut written = 0;
        let mut stalls = 0;
        while written < bytes.len() {
            match self.sink.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(WdHwError::LinkIo(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "PMC link accepted no bytes",
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    stalls += 1;
                    if stalls > WRITE_RETRY_LIMIT {
                        return Err(WdHwError::LinkIo(e));
                    }
                }
                Err(e) => return Err(WdHwError::LinkIo(e)),
            }
        }
        self.sink.flush().map_err(WdHwError::LinkIo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reader_splits_frames_at_cr() {
        let mut reader = FrameReader::new(Cursor::new(b"ACK\rVER=WD PMC v17\r".to_vec()));
        match reader.next().expect("read") {
            ReadEvent::Frame(f) => assert_eq!(f.code, "ACK"),
            _ => panic!("expected frame"),
        }
        match reader.next().expect("read") {
            ReadEvent::Frame(f) => {
                assert_eq!(f.code, "VER");
                assert_eq!(f.value.as_deref(), Some("WD PMC v17"));
            }
            _ => panic!("expected frame"),
        }
        match reader.next().expect("read") {
            ReadEvent::Closed => {}
            _ => panic!("expected end of stream"),
        }
    }

    #[test]
    fn reader_swallows_empty_frames() {
        let mut reader = FrameReader::new(Cursor::new(b"\r \r\n\rACK\r".to_vec()));
        match reader.next().expect("read") {
            ReadEvent::Frame(f) => assert_eq!(f.code, "ACK"),
            _ => panic!("expected frame"),
        }
    }

    #[test]
    fn writer_appends_terminator() {
        let mut out = Vec::new();
        FrameWriter::new(&mut out)
            .write_frame("IMR", Some("FF"))
            .expect("write");
        assert_eq!(out, b"IMR=FF\r");
    }
}
