use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use bytebuffer::ByteBuffer;
use log::debug;
use tokio::net::TcpStream;

use crate::conn::{self, Conn};
use crate::error::{Error, Result};

const VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Something that takes over an accepted or dialed connection.
///
/// The local proxy and the tunnel client hand every data connection to one.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, conn: Conn) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug)]
enum TargetAddress {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl std::fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddress::Ip(addr) => write!(f, "{addr}"),
            TargetAddress::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// Socks5 server side: no authentication, CONNECT only.
#[derive(Debug, Clone)]
pub struct Socks5 {
    dial_timeout: Duration,
}

impl Socks5 {
    pub fn new(dial_timeout: Duration) -> Socks5 {
        Socks5 { dial_timeout }
    }

    pub async fn process(&self, mut down_stream: Conn) -> Result<()> {
        self.negotiate(&mut down_stream).await?;

        let command = self.read_command(&mut down_stream).await?;
        let target_addr = self.read_target_address(&mut down_stream).await?;

        if command != CMD_CONNECT {
            reply(&mut down_stream, REP_COMMAND_NOT_SUPPORTED, None).await?;
            return Err(Error::socks(format!("unsupported command {command}")));
        }

        let up_stream = match self.connect_up_stream(&target_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                let rep = if matches!(e, Error::Timeout(_)) {
                    REP_HOST_UNREACHABLE
                } else {
                    REP_CONNECTION_REFUSED
                };
                reply(&mut down_stream, rep, None).await?;
                return Err(e);
            }
        };

        reply(&mut down_stream, REP_SUCCEEDED, up_stream.local_addr().ok()).await?;
        debug!("socks5 {} -> {target_addr}", down_stream.peer_addr());

        conn::bridge(down_stream, Conn::new(up_stream, None)?).await
    }

    async fn negotiate(&self, down_stream: &mut Conn) -> Result<()> {
        let version = down_stream.read_u8().await?;
        if version != VERSION {
            return Err(Error::socks(format!("unsupported version {version}")));
        }

        let method_num = down_stream.read_u8().await?;
        let mut methods = vec![0; method_num as usize];
        down_stream.read_exact(&mut methods).await?;

        if !methods.contains(&METHOD_NO_AUTH) {
            down_stream
                .write_all(&[VERSION, METHOD_NONE_ACCEPTABLE])
                .await?;
            return Err(Error::socks("client offers no acceptable auth method"));
        }

        down_stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    }

    async fn read_command(&self, down_stream: &mut Conn) -> Result<u8> {
        let mut header = [0; 3];
        down_stream.read_exact(&mut header).await?;
        if header[0] != VERSION {
            return Err(Error::socks(format!("unsupported version {}", header[0])));
        }
        Ok(header[1])
    }

    async fn read_target_address(&self, down_stream: &mut Conn) -> Result<TargetAddress> {
        let addr_type = down_stream.read_u8().await?;

        let addr = match addr_type {
            ATYP_IPV4 => {
                let mut ip = [0; 4];
                down_stream.read_exact(&mut ip).await?;
                let port = down_stream.read_u16().await?;
                TargetAddress::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
            }
            ATYP_IPV6 => {
                let mut ip = [0; 16];
                down_stream.read_exact(&mut ip).await?;
                let port = down_stream.read_u16().await?;
                TargetAddress::Ip(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(ip),
                    port,
                    0,
                    0,
                )))
            }
            ATYP_DOMAIN => {
                let domain_len = down_stream.read_u8().await?;
                let mut domain = vec![0; domain_len as usize];
                down_stream.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| Error::socks("domain is not utf8"))?;
                let port = down_stream.read_u16().await?;
                TargetAddress::Domain(domain, port)
            }
            _ => {
                reply(down_stream, REP_ADDRESS_NOT_SUPPORTED, None).await?;
                return Err(Error::socks(format!("unsupported address type {addr_type}")));
            }
        };

        Ok(addr)
    }

    async fn connect_up_stream(&self, target_addr: &TargetAddress) -> Result<TcpStream> {
        let connect = async {
            match target_addr {
                TargetAddress::Ip(addr) => TcpStream::connect(*addr).await,
                TargetAddress::Domain(domain, port) => {
                    TcpStream::connect((domain.as_str(), *port)).await
                }
            }
        };

        let stream = tokio::time::timeout(self.dial_timeout, connect)
            .await
            .map_err(|_| Error::Timeout(self.dial_timeout))??;
        Ok(stream)
    }
}

impl Handler for Socks5 {
    fn handle(&self, conn: Conn) -> impl Future<Output = Result<()>> + Send {
        self.process(conn)
    }
}

async fn reply(down_stream: &mut Conn, rep: u8, bound: Option<SocketAddr>) -> Result<()> {
    let bound = bound.unwrap_or(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));

    let mut msg = ByteBuffer::new();
    msg.write_bytes(&[VERSION, rep, 0x00]);
    match bound {
        SocketAddr::V4(addr) => {
            msg.write_u8(ATYP_IPV4);
            msg.write_bytes(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            msg.write_u8(ATYP_IPV6);
            msg.write_bytes(&addr.ip().octets());
        }
    }
    msg.write_u16(bound.port());

    down_stream.write_all(msg.as_bytes()).await?;
    Ok(())
}
