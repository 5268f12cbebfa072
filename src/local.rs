use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Secret;
use crate::conn::Conn;
use crate::error::Result;
use crate::socks5::Handler;

/// Plain socks5 server: every accepted connection goes straight to the handler.
pub struct LocalProxy<H> {
    listener: TcpListener,
    secret: Option<Secret>,
    handler: Arc<H>,
}

impl<H: Handler> LocalProxy<H> {
    pub async fn bind(addr: &str, secret: Option<Secret>, handler: H) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("start socks5 server on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            secret,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires. Accept errors are logged and skipped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("socks5 accept error: {e}");
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            let secret = self.secret.clone();
            tokio::spawn(async move {
                let conn = match Conn::new(stream, secret.as_ref()) {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("wrap connection from {peer} failed: {e}");
                        return;
                    }
                };
                if let Err(e) = handler.handle(conn).await {
                    debug!("socks5 session from {peer} ended: {e}");
                }
            });
        }
    }
}
