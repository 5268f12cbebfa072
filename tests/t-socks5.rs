mod common;

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tunsocks::{Conn, LocalProxy, Socks5};

async fn start_proxy(encrypted: bool) -> (SocketAddr, CancellationToken) {
    let config = common::config();
    let secret = config.leg_secret(encrypted).unwrap();
    let proxy = LocalProxy::bind("127.0.0.1:0", secret, Socks5::new(config.dial_timeout))
        .await
        .unwrap();
    let addr = proxy.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(proxy.run(shutdown.clone()));
    (addr, shutdown)
}

#[tokio::test]
async fn connect_through_local_proxy() {
    let target = common::echo_server().await;
    let (proxy, shutdown) = start_proxy(false).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(common::socks5_connect(&mut stream, target).await, 0x00);

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    shutdown.cancel();
}

#[tokio::test]
async fn connect_by_domain_name() {
    let target = common::echo_server().await;
    let (proxy, _shutdown) = start_proxy(false).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0; 2];
    stream.read_exact(&mut method).await.unwrap();

    let host = b"127.0.0.1";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    stream.write_all(b"by name").await.unwrap();
    let mut buf = [0; 7];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"by name");
}

#[tokio::test]
async fn encrypted_local_proxy() {
    let target = common::echo_server().await;
    let (proxy, _shutdown) = start_proxy(true).await;

    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut conn = Conn::new(stream, Some(&common::secret())).unwrap();
    let SocketAddr::V4(target) = target else {
        unreachable!()
    };

    conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0; 2];
    conn.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    conn.write_all(&request).await.unwrap();

    let mut reply = [0; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    conn.write_all(b"sealed").await.unwrap();
    let mut buf = [0; 6];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"sealed");
}

#[tokio::test]
async fn refused_target_is_reported() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = closed.local_addr().unwrap();
    drop(closed);

    let (proxy, _shutdown) = start_proxy(false).await;
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(common::socks5_connect(&mut stream, target).await, 0x05);
}

#[tokio::test]
async fn only_connect_is_supported() {
    let (proxy, _shutdown) = start_proxy(false).await;
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0; 2];
    stream.read_exact(&mut method).await.unwrap();

    // BIND
    stream
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    let mut reply = [0; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07);
}

#[tokio::test]
async fn auth_only_clients_are_refused() {
    let (proxy, _shutdown) = start_proxy(false).await;
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    // username/password only
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut method = [0; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0xFF]);
}
