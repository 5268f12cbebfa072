//! Marks one connection as the control channel.
//!
//! The tunnel client opens with `b"TSK5" | version`; the relay answers
//! `b"TSK5" | status` where status `0x00` accepts. Data connections skip
//! this exchange entirely.

use std::time::Duration;

use log::{info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::msg::{ControlChannel, VERSION};

const HELLO: &[u8; 4] = b"TSK5";
const ACCEPTED: u8 = 0x00;
const REJECTED: u8 = 0x01;

fn greeting(last: u8) -> [u8; 5] {
    let mut buf = [0; 5];
    buf[..4].copy_from_slice(HELLO);
    buf[4] = last;
    buf
}

/// Dial the relay and establish the control channel.
pub async fn client_handshake(addr: &str, timeout: Duration) -> Result<ControlChannel> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&greeting(VERSION)).await?;

        let mut reply = [0; 5];
        stream.read_exact(&mut reply).await?;
        if reply[..4] != HELLO[..] {
            return Err(Error::handshake("relay answered with unknown greeting"));
        }
        if reply[4] != ACCEPTED {
            return Err(Error::handshake(format!(
                "relay rejected control connection (status {:#04x})",
                reply[4]
            )));
        }
        ControlChannel::new(stream)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

async fn accept_control(mut stream: TcpStream) -> Result<ControlChannel> {
    let mut hello = [0; 5];
    stream.read_exact(&mut hello).await?;

    if hello[..4] != HELLO[..] {
        return Err(Error::handshake("peer did not send greeting"));
    }
    if hello[4] != VERSION {
        stream.write_all(&greeting(REJECTED)).await?;
        return Err(Error::handshake(format!(
            "unsupported protocol version {}",
            hello[4]
        )));
    }

    stream.write_all(&greeting(ACCEPTED)).await?;
    ControlChannel::new(stream)
}

/// Wait on `listener` until a peer completes the control handshake.
///
/// Peers that fail or stall past `timeout` are dropped and the wait goes on.
pub async fn server_handshake(listener: &TcpListener, timeout: Duration) -> ControlChannel {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept control connection error: {e}");
                continue;
            }
        };

        match tokio::time::timeout(timeout, accept_control(stream)).await {
            Ok(Ok(control)) => {
                info!("control channel established with {peer}");
                return control;
            }
            Ok(Err(e)) => warn!("handshake with {peer} failed: {e}"),
            Err(_) => warn!("handshake with {peer} timed out after {timeout:?}"),
        }
    }
}
