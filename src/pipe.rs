//! Length-prefixed framing for the process-pipe transport.
//!
//! Used when the peer is reached through a spawned process's stdin/stdout
//! instead of the socket server. Every message is a 4-byte unsigned
//! little-endian length prefix followed by exactly that many bytes of
//! UTF-8 JSON:
//!
//! ```text
//! [u32 LE length] [payload: length bytes of JSON]
//! ```
//!
//! This transport is strictly one peer, one stream, full duplex, and
//! blocking. There is no connection registry and no broadcast. Unlike the
//! socket transport, malformed JSON is fatal to the stream.

use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout};

use serde_json::Value;

/// Maximum message payload size (16 MB).
const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Read one framed message from `reader`.
///
/// Returns `Ok(None)` when the stream is cleanly closed (EOF at the start
/// of the length prefix). Accumulates exactly `length` payload bytes no
/// matter how many underlying reads that takes.
///
/// # Errors
///
/// `UnexpectedEof` when the stream closes mid-prefix or mid-payload;
/// `InvalidData` for a zero or oversized length, or a payload that is not
/// valid JSON. All of these are fatal for this transport.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Option<Value>> {
    let mut len_buf = [0u8; 4];

    // First read distinguishes clean close (zero bytes) from truncation.
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream closed mid length prefix",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let length = u32::from_le_bytes(len_buf);
    if length == 0 {
        return Err(io::Error::new(ErrorKind::InvalidData, "zero-length message"));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("message too large: {length} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;

    serde_json::from_slice(&payload).map(Some).map_err(|e| {
        io::Error::new(ErrorKind::InvalidData, format!("malformed JSON payload: {e}"))
    })
}

/// Write one framed message to `writer` and flush immediately.
///
/// # Errors
///
/// `InvalidInput` when the encoded payload exceeds the size limit, plus
/// any underlying write or flush error.
pub fn write_message<W: Write>(writer: &mut W, message: &Value) -> io::Result<()> {
    let payload = serde_json::to_vec(message).expect("JSON serialization cannot fail");
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("message too large: {} bytes (max {MAX_MESSAGE_SIZE})", payload.len()),
            )
        })?;

    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Blocking full-duplex message transport over a Read/Write pair.
#[derive(Debug)]
pub struct PipeTransport<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R: Read, W: Write> PipeTransport<R, W> {
    /// Wrap a read/write pair.
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader: BufReader::new(reader), writer }
    }

    /// Receive the next message; `Ok(None)` means the peer closed cleanly.
    ///
    /// # Errors
    ///
    /// See [`read_message`].
    pub fn recv(&mut self) -> io::Result<Option<Value>> {
        read_message(&mut self.reader)
    }

    /// Send a message, flushing immediately.
    ///
    /// # Errors
    ///
    /// See [`write_message`].
    pub fn send(&mut self, message: &Value) -> io::Result<()> {
        write_message(&mut self.writer, message)
    }
}

impl PipeTransport<ChildStdout, ChildStdin> {
    /// Attach to a spawned process's piped stdin/stdout.
    ///
    /// # Errors
    ///
    /// Fails when the child was not spawned with both stdio handles piped.
    pub fn from_child(child: &mut Child) -> io::Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not piped"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin not piped"))?;
        Ok(Self::new(stdout, stdin))
    }
}
