use std::net::SocketAddr;

use tokio::io::{self, AsyncReadExt, AsyncWriteExt, Error, ErrorKind};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::config::Secret;
use crate::crypto::{Cipher, MAX_PLAINTEXT};
use crate::Result;

const BUF_SIZE: usize = 4096;

/// How bytes are carried on the wire.
#[derive(Clone)]
enum Codec {
    /// forward data as is
    Plain,
    /// every write is sealed into one encrypted frame
    Encrypted(Cipher),
}

impl Codec {
    fn new(secret: Option<&Secret>) -> Self {
        match secret {
            Some(secret) => Codec::Encrypted(Cipher::new(secret)),
            None => Codec::Plain,
        }
    }
}

/// Read half of a [`Conn`].
pub struct ConnReader {
    half: OwnedReadHalf,
    codec: Codec,
    // decrypted bytes not yet handed to the caller
    pending: Vec<u8>,
    offset: usize,
}

impl ConnReader {
    /// Read some bytes. `Ok(0)` means the peer closed its side.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &self.codec {
            Codec::Plain => self.half.read(buf).await,
            Codec::Encrypted(cipher) => {
                while self.offset >= self.pending.len() {
                    match cipher.open(&mut self.half).await {
                        Ok(plain) => {
                            self.pending = plain;
                            self.offset = 0;
                        }
                        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(0),
                        Err(e) => return Err(e),
                    }
                }
                let available = &self.pending[self.offset..];
                let len = available.len().min(buf.len());
                buf[..len].copy_from_slice(&available[..len]);
                self.offset += len;
                Ok(len)
            }
        }
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => return Err(Error::new(ErrorKind::UnexpectedEof, "connection closed")),
                len => filled += len,
            }
        }
        Ok(())
    }

    pub async fn read_u8(&mut self) -> io::Result<u8> {
        let mut byte = [0; 1];
        self.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    pub async fn read_u16(&mut self) -> io::Result<u16> {
        let mut bytes = [0; 2];
        self.read_exact(&mut bytes).await?;
        Ok(u16::from_be_bytes(bytes))
    }
}

/// Write half of a [`Conn`].
pub struct ConnWriter {
    half: OwnedWriteHalf,
    codec: Codec,
}

impl ConnWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &self.codec {
            Codec::Plain => self.half.write_all(data).await,
            Codec::Encrypted(cipher) => {
                for chunk in data.chunks(MAX_PLAINTEXT) {
                    self.half.write_all(&cipher.seal(chunk)).await?;
                }
                Ok(())
            }
        }
    }

    /// Close the write direction; the peer reads EOF.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.half.shutdown().await
    }
}

/// A TCP connection that may or may not be encrypted.
///
/// Everything above this type (socks5, relay forwarding) is written once
/// against it and never looks at which variant it got.
pub struct Conn {
    reader: ConnReader,
    writer: ConnWriter,
    peer: SocketAddr,
}

impl Conn {
    /// Wrap a raw stream. `secret` turns encryption on for this leg.
    pub fn new(stream: TcpStream, secret: Option<&Secret>) -> io::Result<Conn> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let codec = Codec::new(secret);
        let (read_half, write_half) = stream.into_split();

        Ok(Conn {
            reader: ConnReader {
                half: read_half,
                codec: codec.clone(),
                pending: Vec::new(),
                offset: 0,
            },
            writer: ConnWriter {
                half: write_half,
                codec,
            },
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.writer.codec, Codec::Encrypted(_))
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.reader.read_exact(buf).await
    }

    pub async fn read_u8(&mut self) -> io::Result<u8> {
        self.reader.read_u8().await
    }

    pub async fn read_u16(&mut self) -> io::Result<u16> {
        self.reader.read_u16().await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    pub fn into_split(self) -> (ConnReader, ConnWriter) {
        (self.reader, self.writer)
    }
}

async fn pipe(src: &mut ConnReader, dest: &mut ConnWriter) -> io::Result<()> {
    let mut buf = [0; BUF_SIZE];
    loop {
        match src.read(&mut buf).await? {
            0 => {
                dest.shutdown().await?;
                break Ok(());
            }
            len => dest.write_all(&buf[..len]).await?,
        }
    }
}

/// Transfer data between two connections until both directions hit EOF or
/// either one fails. Both connections are closed on return.
pub async fn bridge(a: Conn, b: Conn) -> Result<()> {
    let (mut a_read, mut a_write) = a.into_split();
    let (mut b_read, mut b_write) = b.into_split();

    let a_to_b = pipe(&mut a_read, &mut b_write);
    let b_to_a = pipe(&mut b_read, &mut a_write);

    tokio::try_join!(a_to_b, b_to_a)?;
    Ok(())
}
