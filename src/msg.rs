//! Control channel framing.
//!
//! Every control frame is six bytes:
//!
//! ```text
//! 0xA5 0x5A | version | command | count | checksum
//! ```
//!
//! `checksum` is `!(version + command + count)` with wrapping addition. The
//! magic prefix lets a reader skip garbage and pick up at the next frame.

use std::net::SocketAddr;
use std::sync::Arc;

use bytebuffer::ByteBuffer;
use strum_macros::{Display, EnumIter, FromRepr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{DecodeError, Error, Result};

pub const MAGIC: [u8; 2] = [0xA5, 0x5A];
pub const VERSION: u8 = 0x01;
pub const FRAME_LEN: usize = 6;

const READ_CHUNK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, FromRepr)]
#[repr(u8)]
pub enum Command {
    /// ask the tunnel client for `count` new data connections
    #[strum(serialize = "CONNECT_ME")]
    ConnectMe = 0x01,
    /// peer is going away
    #[strum(serialize = "CLEANUP")]
    Cleanup = 0x02,
    /// keepalive, never answered
    #[strum(serialize = "HEARTBEAT")]
    Heartbeat = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub command: Command,
    pub count: u8,
}

fn checksum(version: u8, command: u8, count: u8) -> u8 {
    !version.wrapping_add(command).wrapping_add(count)
}

/// Whether `rest` could be the beginning of a frame. A lone trailing magic
/// byte counts, since the next read may complete it.
fn could_start(rest: &[u8]) -> bool {
    match rest {
        [] => true,
        [first] => *first == MAGIC[0],
        [first, second, ..] => [*first, *second] == MAGIC,
    }
}

/// Offset of the first byte that could start a frame, or `None` when `buf`
/// already starts with one (or with a prefix of the magic).
fn misalignment(buf: &[u8]) -> Option<usize> {
    if could_start(buf) {
        return None;
    }
    Some(
        (1..buf.len())
            .find(|&i| could_start(&buf[i..]))
            .unwrap_or(buf.len()),
    )
}

/// Bytes to drop after a frame with good magic failed to decode: up to the
/// next magic inside the frame window, or the whole frame when there is none.
fn bad_frame_len(buf: &[u8]) -> usize {
    (1..FRAME_LEN.min(buf.len()))
        .find(|&i| could_start(&buf[i..]))
        .unwrap_or(FRAME_LEN)
}

impl ControlMessage {
    pub fn new(command: Command, count: u8) -> Self {
        Self { command, count }
    }

    pub fn connect_me(count: u8) -> Self {
        Self::new(Command::ConnectMe, count)
    }

    pub fn cleanup() -> Self {
        Self::new(Command::Cleanup, 0)
    }

    pub fn heartbeat() -> Self {
        Self::new(Command::Heartbeat, 0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let command = self.command as u8;
        let mut buf = ByteBuffer::new();
        buf.write_bytes(&MAGIC);
        buf.write_u8(VERSION);
        buf.write_u8(command);
        buf.write_u8(self.count);
        buf.write_u8(checksum(VERSION, command, self.count));
        buf.into_vec()
    }

    /// Decode the frame at the start of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed. On `BadMagic { skipped }` the
    /// caller drops `skipped` bytes; on any other error it drops the frame,
    /// or less when another magic starts inside it.
    pub fn decode(buf: &[u8]) -> std::result::Result<Option<ControlMessage>, DecodeError> {
        if let Some(skipped) = misalignment(buf) {
            return Err(DecodeError::BadMagic { skipped });
        }
        if buf.len() < FRAME_LEN {
            return Ok(None);
        }

        let (version, command, count, actual) = (buf[2], buf[3], buf[4], buf[5]);
        let expected = checksum(version, command, count);
        if expected != actual {
            return Err(DecodeError::BadChecksum { expected, actual });
        }
        if version != VERSION {
            return Err(DecodeError::BadVersion(version));
        }
        let command = Command::from_repr(command).ok_or(DecodeError::UnknownCommand(command))?;

        Ok(Some(ControlMessage { command, count }))
    }
}

/// Pulls control frames off a stream.
///
/// A decode error only costs the bad bytes; the next call resumes at the
/// following frame. I/O failure and EOF end the channel.
#[derive(Debug)]
pub struct ControlReader<R> {
    reader: R,
    buf: Vec<u8>,
    skipped: usize,
}

impl<R> ControlReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(READ_CHUNK),
            skipped: 0,
        }
    }

    pub async fn recv(&mut self) -> Result<ControlMessage> {
        loop {
            match ControlMessage::decode(&self.buf) {
                Ok(None) => self.fill().await?,
                Err(DecodeError::BadMagic { skipped }) => {
                    self.buf.drain(..skipped);
                    self.skipped += skipped;
                    // garbage is reported once a whole magic marks the next frame
                    if self.buf.len() < MAGIC.len() {
                        self.fill().await?;
                    }
                }
                _ if self.skipped > 0 => return Err(self.take_skipped()),
                Ok(Some(msg)) => {
                    self.buf.drain(..FRAME_LEN);
                    return Ok(msg);
                }
                Err(e) => {
                    let len = bad_frame_len(&self.buf);
                    self.buf.drain(..len);
                    return Err(e.into());
                }
            }
        }
    }

    fn take_skipped(&mut self) -> Error {
        let skipped = std::mem::take(&mut self.skipped);
        DecodeError::BadMagic { skipped }.into()
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0; READ_CHUNK];
        match self.reader.read(&mut chunk).await? {
            0 => Err(Error::ControlClosed),
            len => {
                self.buf.extend_from_slice(&chunk[..len]);
                Ok(())
            }
        }
    }
}

/// Shared write side of the control connection.
///
/// Clones share one socket; each `send` writes a whole frame while holding
/// the lock, so concurrent senders never interleave bytes.
#[derive(Debug, Clone)]
pub struct ControlSender {
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl ControlSender {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn send(&self, msg: ControlMessage) -> Result<()> {
        let frame = msg.encode();
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

/// The single control connection of a tunnel session.
#[derive(Debug)]
pub struct ControlChannel {
    pub reader: ControlReader<tokio::net::tcp::OwnedReadHalf>,
    pub sender: ControlSender,
    pub peer: SocketAddr,
}

impl ControlChannel {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: ControlReader::new(read_half),
            sender: ControlSender::new(write_half),
            peer,
        })
    }
}
