use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Secret};
use crate::conn::{self, Conn};
use crate::error::Result;
use crate::handshake::server_handshake;
use crate::msg::{Command, ControlChannel, ControlMessage, ControlReader, ControlSender};
use crate::session::{join_failure, SessionEnd};

/// An end-user connection waiting for its data connection.
struct PendingLocal {
    stream: TcpStream,
    peer: SocketAddr,
}

/// The publicly reachable side.
///
/// The master listener takes the tunnel client's control connection and then
/// its data connections; the local listener takes end users. Each end user
/// is paired, in arrival order, with the next data connection.
pub struct Relay {
    master: TcpListener,
    local: TcpListener,
    config: Config,
    master_secret: Option<Secret>,
    local_secret: Option<Secret>,
}

impl Relay {
    pub async fn bind(
        master_addr: &str,
        local_addr: &str,
        config: Config,
        master_encrypted: bool,
        local_encrypted: bool,
    ) -> Result<Relay> {
        config.validate()?;
        let master_secret = config.leg_secret(master_encrypted)?;
        let local_secret = config.leg_secret(local_encrypted)?;

        let master = TcpListener::bind(master_addr).await?;
        info!("listen on {} for remote socks5 server", master.local_addr()?);
        let local = TcpListener::bind(local_addr).await?;

        Ok(Relay {
            master,
            local,
            config,
            master_secret,
            local_secret,
        })
    }

    pub fn master_addr(&self) -> Result<SocketAddr> {
        Ok(self.master.local_addr()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local.local_addr()?)
    }

    /// Wait for the tunnel client, then pair connections until either side
    /// sends CLEANUP, `shutdown` fires, or the control connection fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Relay {
            master,
            local,
            config,
            master_secret,
            local_secret,
        } = self;

        let ControlChannel { reader, sender, .. } = tokio::select! {
            biased;
            control = server_handshake(&master, config.handshake_timeout) => control,
            _ = shutdown.cancelled() => return Ok(()),
        };
        info!("forward socks5 server to {}", local.local_addr()?);

        let session = shutdown.child_token();
        let (pending_tx, mut pending_rx) = mpsc::channel(config.queue_capacity());

        let control = tokio::spawn(read_control(reader, session.clone()));
        let acceptor = tokio::spawn(accept_local(
            local,
            pending_tx,
            sender.clone(),
            session.clone(),
        ));

        loop {
            let accepted = tokio::select! {
                _ = session.cancelled() => break,
                accepted = master.accept() => accepted,
            };
            let (remote, remote_peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept data connection error: {e}");
                    continue;
                }
            };

            let pending = tokio::select! {
                _ = session.cancelled() => break,
                pending = pending_rx.recv() => match pending {
                    Some(pending) => pending,
                    None => break,
                },
            };
            debug!("pair {} <-> {remote_peer}", pending.peer);

            let master_secret = master_secret.clone();
            let local_secret = local_secret.clone();
            tokio::spawn(async move {
                let peer = pending.peer;
                if let Err(e) = forward(pending.stream, remote, local_secret, master_secret).await {
                    debug!("forward for {peer} ended: {e}");
                }
            });
        }
        session.cancel();

        let end = control
            .await
            .unwrap_or_else(|e| SessionEnd::Lost(join_failure(e)));
        let failure = match acceptor.await {
            Ok(result) => result.err(),
            Err(e) => Some(join_failure(e)),
        };
        end.or_failure(failure).finish(&sender).await
    }
}

async fn forward(
    local: TcpStream,
    remote: TcpStream,
    local_secret: Option<Secret>,
    master_secret: Option<Secret>,
) -> Result<()> {
    let remote = Conn::new(remote, master_secret.as_ref())?;
    let local = Conn::new(local, local_secret.as_ref())?;
    conn::bridge(remote, local).await
}

/// Queue every end user and ask the tunnel client for one connection each.
async fn accept_local(
    listener: TcpListener,
    pending: mpsc::Sender<PendingLocal>,
    sender: ControlSender,
    session: CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = session.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept local connection error: {e}");
                continue;
            }
        };

        // a full queue holds off new requests instead of dropping this one
        tokio::select! {
            _ = session.cancelled() => return Ok(()),
            queued = pending.send(PendingLocal { stream, peer }) => {
                if queued.is_err() {
                    return Ok(());
                }
            }
        }

        if let Err(e) = sender.send(ControlMessage::connect_me(1)).await {
            session.cancel();
            return Err(e);
        }
        debug!("local connection from {peer} queued, CONNECT_ME sent");
    }
}

async fn read_control(
    mut reader: ControlReader<OwnedReadHalf>,
    session: CancellationToken,
) -> SessionEnd {
    loop {
        let msg = tokio::select! {
            _ = session.cancelled() => return SessionEnd::Cancelled,
            msg = reader.recv() => msg,
        };

        match msg {
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
            Ok(msg) => debug!("ignore {} from tunnel client", msg.command),
            Err(e) if e.is_transient() => warn!("skip bad control frame: {e}"),
            Err(e) => {
                session.cancel();
                return SessionEnd::Lost(e);
            }
        }
    }
}

