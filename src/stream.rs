//! # Byte-Stream Adapters
//!
//! Decorators that sit between a raw byte link (TCP socket, serial port or an
//! in-memory pipe) and the frame codecs.
//!
//! - [`TimedStream`]: raw passthrough where every read is bounded by a
//!   deadline. Used directly by the RTU codec and underneath the ASCII adapter.
//! - [`AsciiStream`]: translates between payload bytes and the uppercase hex
//!   character pairs of Modbus ASCII, recognising the `:` and `CR LF` frame
//!   delimiters.
//!
//! A read that sees no byte before its deadline fails with
//! [`ModbusError::Timeout`]; it never returns an empty read. A peer closing
//! the link is reported as [`ModbusError::Connection`].

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::trace;

use crate::error::{ModbusError, ModbusResult};

/// ASCII frame start character
pub const ASCII_FRAME_START: u8 = b':';

/// ASCII frame end sequence
pub const ASCII_FRAME_END: [u8; 2] = [b'\r', b'\n'];

const READ_CHUNK: usize = 256;

/// Timeout-bounded byte stream
///
/// Bytes are read from the link in chunks into an owned buffer and handed out
/// one at a time, so a slow link costs one wake-up per chunk rather than per
/// byte. The buffer belongs to this stream alone and is drained by
/// [`TimedStream::clear_input`] between transactions.
#[derive(Debug)]
pub struct TimedStream<S> {
    inner: S,
    buffer: BytesMut,
    read_timeout: Duration,
}

impl<S> TimedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap `inner`, bounding each read by `read_timeout`
    pub fn new(inner: S, read_timeout: Duration) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            read_timeout,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, read_timeout: Duration) {
        self.read_timeout = read_timeout;
    }

    /// Unwrap the link, dropping any buffered input
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Read one chunk into the buffer, waiting until `deadline`
    async fn fill_until(&mut self, deadline: Instant) -> ModbusResult<()> {
        match timeout_at(deadline, self.inner.read_buf(&mut self.buffer)).await {
            Ok(Ok(0)) => Err(ModbusError::connection("Connection closed by peer")),
            Ok(Ok(n)) => {
                trace!("Buffered {} bytes from link", n);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ModbusError::timeout(
                "Read byte",
                self.read_timeout.as_millis() as u64,
            )),
        }
    }

    /// Wait until at least one byte is buffered, without consuming it
    ///
    /// Cancelling this future never loses input, so callers can race it
    /// against an outer deadline before committing to reading a frame.
    pub async fn wait_readable(&mut self) -> ModbusResult<()> {
        if self.buffer.is_empty() {
            let deadline = Instant::now() + self.read_timeout;
            self.fill_until(deadline).await?;
        }
        Ok(())
    }

    /// Read one byte, waiting at most the configured read timeout
    pub async fn read_byte(&mut self) -> ModbusResult<u8> {
        if self.buffer.is_empty() {
            let deadline = Instant::now() + self.read_timeout;
            self.fill_until(deadline).await?;
        }
        Ok(self.buffer.get_u8())
    }

    /// Read exactly `count` bytes and append them to `out`
    ///
    /// Each byte is individually bounded by the read timeout, matching the
    /// inter-character timeout of a serial line.
    pub async fn read_exact_into(&mut self, out: &mut BytesMut, count: usize) -> ModbusResult<()> {
        let mut remaining = count;
        while remaining > 0 {
            if self.buffer.is_empty() {
                let deadline = Instant::now() + self.read_timeout;
                self.fill_until(deadline).await?;
            }
            let take = remaining.min(self.buffer.len());
            out.extend_from_slice(&self.buffer.split_to(take));
            remaining -= take;
        }
        Ok(())
    }

    /// Number of bytes that can be read without waiting
    ///
    /// Pulls whatever the link has ready into the buffer, without blocking.
    pub async fn available(&mut self) -> ModbusResult<usize> {
        match timeout(Duration::ZERO, self.inner.read_buf(&mut self.buffer)).await {
            Ok(Ok(0)) if self.buffer.is_empty() => {
                Err(ModbusError::connection("Connection closed by peer"))
            }
            Ok(Err(e)) => Err(e.into()),
            _ => Ok(self.buffer.len()),
        }
    }

    /// Write all bytes and flush the link
    pub async fn write_all(&mut self, data: &[u8]) -> ModbusResult<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Discard up to `max_bytes` of input arriving within `window`
    ///
    /// A zero window drains only what is already available. Returns the
    /// number of bytes discarded; reaching the end of the window is not an
    /// error.
    pub async fn clear_input(&mut self, max_bytes: usize, window: Duration) -> ModbusResult<usize> {
        let deadline = Instant::now() + window;
        let mut discarded = 0;

        while discarded < max_bytes {
            if !self.buffer.is_empty() {
                let take = (max_bytes - discarded).min(self.buffer.len());
                self.buffer.advance(take);
                discarded += take;
                continue;
            }

            match timeout_at(deadline, self.inner.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => return Err(ModbusError::connection("Connection closed by peer")),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        if discarded > 0 {
            trace!("Cleared {} bytes of input", discarded);
        }
        Ok(discarded)
    }

    /// Shut down the write half of the link
    pub async fn shutdown(&mut self) -> ModbusResult<()> {
        self.buffer.clear();
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// One decoded unit of a Modbus ASCII character stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsciiToken {
    /// `:`
    FrameStart,
    /// `CR LF`
    FrameEnd,
    /// A payload byte decoded from two hex characters
    Byte(u8),
}

/// Modbus ASCII adapter
///
/// Writes payload bytes as uppercase hex pairs and reads hex pairs back into
/// bytes. Every character read inherits the timeout of the underlying
/// [`TimedStream`].
#[derive(Debug)]
pub struct AsciiStream<S> {
    raw: TimedStream<S>,
}

impl<S> AsciiStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(inner: S, read_timeout: Duration) -> Self {
        Self {
            raw: TimedStream::new(inner, read_timeout),
        }
    }

    /// The character-level stream underneath
    pub fn raw(&mut self) -> &mut TimedStream<S> {
        &mut self.raw
    }

    pub fn into_inner(self) -> S {
        self.raw.into_inner()
    }

    /// Read the next token
    ///
    /// # Errors
    ///
    /// [`ModbusError::Frame`] when a character that is neither a delimiter nor
    /// a hex digit appears, or when `CR` is not followed by `LF`. A `:` in the
    /// middle of a hex pair is reported as a new frame start.
    pub async fn read_token(&mut self) -> ModbusResult<AsciiToken> {
        let first = self.raw.read_byte().await?;
        match first {
            ASCII_FRAME_START => Ok(AsciiToken::FrameStart),
            b'\r' => {
                let next = self.raw.read_byte().await?;
                if next == b'\n' {
                    Ok(AsciiToken::FrameEnd)
                } else if next == ASCII_FRAME_START {
                    Ok(AsciiToken::FrameStart)
                } else {
                    Err(ModbusError::frame(format!(
                        "Expected LF after CR, got 0x{:02X}",
                        next
                    )))
                }
            }
            _ => {
                let high = hex_value(first)?;
                let second = self.raw.read_byte().await?;
                if second == ASCII_FRAME_START {
                    return Ok(AsciiToken::FrameStart);
                }
                let low = hex_value(second)?;
                Ok(AsciiToken::Byte((high << 4) | low))
            }
        }
    }

    /// Write `payload` as one complete frame: `:` + hex pairs + `CR LF`
    ///
    /// Returns the number of characters put on the wire.
    pub async fn write_frame(&mut self, payload: &[u8]) -> ModbusResult<usize> {
        let mut frame = BytesMut::with_capacity(payload.len() * 2 + 3);
        encode_frame(payload, &mut frame);
        self.raw.write_all(&frame).await?;
        Ok(frame.len())
    }
}

/// Encode one byte as two uppercase hex characters
pub fn byte_to_hex(byte: u8) -> [u8; 2] {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    [DIGITS[(byte >> 4) as usize], DIGITS[(byte & 0x0F) as usize]]
}

/// Value of one hex character
///
/// Only `0-9` and `A-F` are legal on a Modbus ASCII line; lowercase digits
/// are rejected like any other foreign character.
pub fn hex_value(c: u8) -> ModbusResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(ModbusError::frame(format!(
            "Invalid ASCII hex character: 0x{:02X}",
            c
        ))),
    }
}

/// Append the ASCII framing of `payload` to `out`
pub fn encode_frame(payload: &[u8], out: &mut BytesMut) {
    out.extend_from_slice(&[ASCII_FRAME_START]);
    for &byte in payload {
        out.extend_from_slice(&byte_to_hex(byte));
    }
    out.extend_from_slice(&ASCII_FRAME_END);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_hex_helpers() {
        assert_eq!(byte_to_hex(0x00), *b"00");
        assert_eq!(byte_to_hex(0xA5), *b"A5");
        assert_eq!(byte_to_hex(0xFF), *b"FF");
        assert_eq!(hex_value(b'7').unwrap(), 7);
        assert_eq!(hex_value(b'C').unwrap(), 12);
        assert!(matches!(hex_value(b'c'), Err(ModbusError::Frame { .. })));
        assert!(matches!(hex_value(b'G'), Err(ModbusError::Frame { .. })));
    }

    #[test]
    fn test_encode_frame() {
        let mut out = BytesMut::new();
        encode_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xFA], &mut out);
        assert_eq!(&out[..], b":010300000002FA\r\n");
    }

    #[tokio::test]
    async fn test_read_byte_and_exact() {
        let (mut slave, master) = duplex(64);
        let mut stream = TimedStream::new(master, Duration::from_millis(100));

        slave.write_all(&[0x11, 0x22, 0x33, 0x44]).await.unwrap();
        assert_eq!(stream.read_byte().await.unwrap(), 0x11);

        let mut out = BytesMut::new();
        stream.read_exact_into(&mut out, 3).await.unwrap();
        assert_eq!(&out[..], &[0x22, 0x33, 0x44]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_without_data() {
        let (_slave, master) = duplex(64);
        let mut stream = TimedStream::new(master, Duration::from_millis(100));

        let started = Instant::now();
        let result = stream.read_byte().await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(ModbusError::Timeout { timeout_ms: 100, .. })));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_read_reports_closed_link() {
        let (slave, master) = duplex(64);
        let mut stream = TimedStream::new(master, Duration::from_millis(100));
        drop(slave);

        assert!(matches!(
            stream.read_byte().await,
            Err(ModbusError::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_available_does_not_wait() {
        let (mut slave, master) = duplex(64);
        let mut stream = TimedStream::new(master, Duration::from_millis(100));

        assert_eq!(stream.available().await.unwrap(), 0);
        slave.write_all(&[1, 2, 3]).await.unwrap();
        assert_eq!(stream.available().await.unwrap(), 3);
        assert_eq!(stream.read_byte().await.unwrap(), 1);
        assert_eq!(stream.available().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clear_input_drains_available() {
        let (mut slave, master) = duplex(64);
        let mut stream = TimedStream::new(master, Duration::from_millis(100));

        slave.write_all(&[9; 10]).await.unwrap();
        let cleared = stream.clear_input(4096, Duration::ZERO).await.unwrap();
        assert_eq!(cleared, 10);
        assert_eq!(stream.available().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_input_stops_at_limit() {
        let (mut slave, master) = duplex(64);
        let mut stream = TimedStream::new(master, Duration::from_millis(100));

        slave.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
        let cleared = stream.clear_input(3, Duration::from_millis(50)).await.unwrap();
        assert_eq!(cleared, 3);
        assert_eq!(stream.read_byte().await.unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_input_waits_for_window() {
        let (mut slave, master) = duplex(64);
        let mut stream = TimedStream::new(master, Duration::from_millis(100));

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            slave.write_all(&[0xAA, 0xBB]).await.unwrap();
            slave
        });

        let cleared = stream.clear_input(8, Duration::from_millis(100)).await.unwrap();
        assert_eq!(cleared, 2);
        let _slave = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_ascii_tokens() {
        let (mut slave, master) = duplex(64);
        let mut stream = AsciiStream::new(master, Duration::from_millis(100));

        slave.write_all(b":01FF\r\n").await.unwrap();
        assert_eq!(stream.read_token().await.unwrap(), AsciiToken::FrameStart);
        assert_eq!(stream.read_token().await.unwrap(), AsciiToken::Byte(0x01));
        assert_eq!(stream.read_token().await.unwrap(), AsciiToken::Byte(0xFF));
        assert_eq!(stream.read_token().await.unwrap(), AsciiToken::FrameEnd);
    }

    #[tokio::test]
    async fn test_ascii_rejects_non_hex() {
        let (mut slave, master) = duplex(64);
        let mut stream = AsciiStream::new(master, Duration::from_millis(100));

        slave.write_all(b"0Z").await.unwrap();
        assert!(matches!(
            stream.read_token().await,
            Err(ModbusError::Frame { .. })
        ));
    }

    #[tokio::test]
    async fn test_ascii_rejects_lowercase_hex() {
        let (mut slave, master) = duplex(64);
        let mut stream = AsciiStream::new(master, Duration::from_millis(100));

        slave.write_all(b":0a").await.unwrap();
        assert_eq!(stream.read_token().await.unwrap(), AsciiToken::FrameStart);
        assert!(matches!(
            stream.read_token().await,
            Err(ModbusError::Frame { .. })
        ));
    }

    #[tokio::test]
    async fn test_ascii_write_frame() {
        let (mut slave, master) = duplex(64);
        let mut stream = AsciiStream::new(master, Duration::from_millis(100));

        let written = stream.write_frame(&[0x11, 0x03, 0x7E]).await.unwrap();
        assert_eq!(written, 9);

        let mut buf = [0u8; 9];
        slave.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b":11037E\r\n");
    }
}
