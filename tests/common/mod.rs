#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tunsocks::{Config, Conn, Handler, Result, Secret};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn secret() -> Secret {
    Secret::new(*b"0123456789abcdef")
}

pub fn config() -> Config {
    Config {
        heartbeat_period: Duration::from_millis(200),
        max_connections: 16,
        dial_timeout: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(2),
        secret: Some(secret()),
    }
}

/// Echoes everything back on whatever connection it is handed.
pub struct Echo;

impl Handler for Echo {
    fn handle(&self, conn: Conn) -> impl Future<Output = Result<()>> + Send {
        echo(conn)
    }
}

async fn echo(mut conn: Conn) -> Result<()> {
    let mut buf = [0; 1024];
    loop {
        match conn.read(&mut buf).await? {
            0 => return Ok(()),
            len => conn.write_all(&buf[..len]).await?,
        }
    }
}

/// Counts handed over connections and closes them.
#[derive(Clone, Default)]
pub struct Counting {
    pub handled: Arc<AtomicUsize>,
}

impl Handler for Counting {
    fn handle(&self, _conn: Conn) -> impl Future<Output = Result<()>> + Send {
        self.handled.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(()))
    }
}

/// Plain TCP echo server standing in for a socks5 target.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Two connected sockets: (dialed, accepted).
pub async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dialed = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (accepted, _) = listener.accept().await.unwrap();
    (dialed, accepted)
}

/// Run the client half of a socks5 CONNECT to an IPv4 target and return the
/// reply code.
pub async fn socks5_connect(stream: &mut TcpStream, target: SocketAddr) -> u8 {
    let SocketAddr::V4(target) = target else {
        panic!("ipv4 target expected");
    };

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    reply[1]
}
