use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Provides a facility to read CRLF-terminated lines and fixed-length job
/// bodies from a stream.
///
/// Both kinds of read share one buffer, so a pipelined client that sends a
/// command line, a body, and further commands in a single packet is handled
/// correctly.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but lacks a CRLF.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    /// Data source
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Reads a line from the internal buffer and/or reader. On an end-of-stream
    /// condition, returns a None result, discarding any partly-read line in the
    /// internal buffer.
    ///
    /// This function is cancel-safe: its only async operation is a `read_buf`
    /// against the internal `reader`, and so it has the same guarantees:
    /// either a complete read occurs and is processed, or this is cancelled.
    ///
    /// On a read error, the error value is returned after processing all
    /// pending lines in the internal buffer, but calling `read_line` again will
    /// attempt a new read safely.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // We slice and dice buf here to avoid re-reading all but the last
            // byte of the part of the command we've already seen, keeping
            // O(bytes_read) behaviour.
            // Note also we need to scan from one position earlier than the
            // start of the newest bytes in case we received a \r then \n on the
            // next read.
            // The outer loop ensures pipelined lines that arrive in the same
            // read_buf call are handled correctly: we only call read_buf once
            // all pending lines in the internal buffer have been removed.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                // This should be a complete command. Freeze the result to make
                // it read-only.
                let cmd =
                    self.buf.split_to(self.maybe_crlf_from + eoc + 2).freeze();

                // Drop trailing b"\r\n".
                let cmd = cmd.slice(0..cmd.len() - 2);

                // Zero out the maybe_crlf_from position so we restart scanning
                // for commands from the start of the unread buffer section.
                self.maybe_crlf_from = 0;

                return Ok(Some(cmd));
            } else {
                // Try reading from the reader and accumulating in the buffer;
                // if we receive any bytes, re-scan for a CRLF, otherwise
                // assume the connection is dead/closed.
                let n_bytes_read =
                    match self.reader.read_buf(&mut self.buf).await {
                        Ok(n) => n,
                        Err(e) => {
                            self.pending_error = Some(e);
                            0
                        },
                    };

                // Slightly convoluted, but all this does is set maybe_crlf_from
                // to the byte before the first byte returned in the read_buf
                // call (and 0 if buf is empty).
                self.maybe_crlf_from =
                    self.buf.len().checked_sub(n_bytes_read + 1).unwrap_or(0);

                // If we didn't read any bytes this time around, assume we've
                // reached an end-of-stream condition. Return any pending error:
                // we wouldn't be able to parse out another line, given we just
                // read 0 bytes.
                if n_bytes_read == 0 {
                    return match self.pending_error.take() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    };
                }
            }
        }
    }

    /// Reads exactly `n` bytes of raw job data, consuming anything already
    /// buffered first. Returns None if the stream ends before `n` bytes
    /// arrive.
    ///
    /// The caller is expected to validate the CRLF trailer itself: the last
    /// two bytes of a wire body are framing, not data, and a client that
    /// miscounts its body length desynchronises the stream.
    pub async fn read_data(&mut self, n: usize) -> io::Result<Option<Bytes>> {
        while self.buf.len() < n {
            let n_bytes_read = self.reader.read_buf(&mut self.buf).await?;
            if n_bytes_read == 0 {
                return Ok(None);
            }
        }

        let data = self.buf.split_to(n).freeze();

        // Anything left over is the start of the next pipelined command, so
        // line scanning must restart from the front of the buffer.
        self.maybe_crlf_from = 0;

        Ok(Some(data))
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
            pending_error: None,
        }
    }
}
