use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Secret};
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::handshake::client_handshake;
use crate::msg::{Command, ControlChannel, ControlMessage, ControlReader, ControlSender};
use crate::session::{join_failure, SessionEnd};
use crate::socks5::Handler;

/// One unit of demand for a data connection.
#[derive(Debug, Clone, Copy)]
struct ConnectRequest {
    seq: u64,
}

/// The side behind NAT. Keeps a control channel open to the relay and dials
/// a fresh data connection back for every unit of CONNECT_ME it receives.
pub struct TunnelClient<H> {
    relay: String,
    config: Config,
    secret: Option<Secret>,
    handler: Arc<H>,
}

impl<H: Handler> TunnelClient<H> {
    /// `encrypted` applies to the data connections dialed back to the relay.
    pub fn new(
        relay: impl Into<String>,
        config: Config,
        encrypted: bool,
        handler: H,
    ) -> Result<Self> {
        config.validate()?;
        let secret = config.leg_secret(encrypted)?;
        Ok(Self {
            relay: relay.into(),
            config,
            secret,
            handler: Arc::new(handler),
        })
    }

    /// Run one tunnel session.
    ///
    /// Returns `Ok` when either side asked for cleanup and
    /// `Err(Error::ControlClosed)` when the control connection died. A failed
    /// handshake is returned as is; there is no retry.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let ControlChannel {
            reader,
            sender,
            peer,
        } = client_handshake(&self.relay, self.config.handshake_timeout).await?;
        info!("control channel to relay {peer} established");

        let session = shutdown.child_token();
        let (request_tx, mut request_rx) = mpsc::channel(self.config.queue_capacity());

        let beat = tokio::spawn(heartbeat(
            sender.clone(),
            self.config.heartbeat_period,
            session.clone(),
        ));
        let control = tokio::spawn(read_control(reader, request_tx, session.clone()));

        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                request = request_rx.recv() => match request {
                    Some(request) => self.dispatch(request),
                    None => break,
                },
            }
        }
        session.cancel();

        let end = control
            .await
            .unwrap_or_else(|e| SessionEnd::Lost(join_failure(e)));
        let failure = match beat.await {
            Ok(result) => result.err(),
            Err(e) => Some(join_failure(e)),
        };
        end.or_failure(failure).finish(&sender).await
    }

    fn dispatch(&self, request: ConnectRequest) {
        let relay = self.relay.clone();
        let dial_timeout = self.config.dial_timeout;
        let secret = self.secret.clone();
        let handler = Arc::clone(&self.handler);

        tokio::spawn(async move {
            let stream = match dial(&relay, dial_timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    info!("connect request #{}: dial {relay} failed: {e}", request.seq);
                    return;
                }
            };
            let conn = match Conn::new(stream, secret.as_ref()) {
                Ok(conn) => conn,
                Err(e) => {
                    info!("connect request #{}: wrap failed: {e}", request.seq);
                    return;
                }
            };
            debug!("connect request #{} fulfilled", request.seq);

            if let Err(e) = handler.handle(conn).await {
                debug!("connect request #{}: session ended: {e}", request.seq);
            }
        });
    }
}

async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout(timeout))??;
    Ok(stream)
}

async fn heartbeat(
    sender: ControlSender,
    period: Duration,
    session: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = session.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                if let Err(e) = sender.send(ControlMessage::heartbeat()).await {
                    session.cancel();
                    return Err(e);
                }
            }
        }
    }
}

async fn read_control(
    mut reader: ControlReader<OwnedReadHalf>,
    requests: mpsc::Sender<ConnectRequest>,
    session: CancellationToken,
) -> SessionEnd {
    let mut seq = 0;
    loop {
        let msg = tokio::select! {
            _ = session.cancelled() => return SessionEnd::Cancelled,
            msg = reader.recv() => msg,
        };

        match msg {
            Ok(ControlMessage {
                command: Command::ConnectMe,
                count,
            }) => {
                debug!("relay asks for {count} connections");
                // a full queue blocks here rather than losing requests
                for _ in 0..count {
                    seq += 1;
                    tokio::select! {
                        _ = session.cancelled() => return SessionEnd::Cancelled,
                        sent = requests.send(ConnectRequest { seq }) => {
                            if sent.is_err() {
                                return SessionEnd::Cancelled;
                            }
                        }
                    }
                }
            }
            Ok(ControlMessage {
                command: Command::Cleanup,
                ..
            }) => {
                session.cancel();
                return SessionEnd::Cleanup;
            }
            Ok(ControlMessage {
                command: Command::Heartbeat,
                ..
            }) => {}
            Err(e) if e.is_transient() => warn!("skip bad control frame: {e}"),
            Err(e) => {
                session.cancel();
                return SessionEnd::Lost(e);
            }
        }
    }
}
