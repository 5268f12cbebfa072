use log::{info, warn};

use crate::error::{Error, Result};
use crate::msg::{ControlMessage, ControlSender};

/// How a tunnel session's control channel came to an end.
#[derive(Debug)]
pub enum SessionEnd {
    /// the peer sent CLEANUP
    Cleanup,
    /// our own shutdown token fired
    Cancelled,
    /// the control connection failed
    Lost(Error),
}

impl SessionEnd {
    /// A failure reported by a sibling task outranks a plain cancellation,
    /// since the failure is what triggered it.
    pub fn or_failure(self, failure: Option<Error>) -> SessionEnd {
        match (self, failure) {
            (SessionEnd::Cancelled, Some(e)) => SessionEnd::Lost(e),
            (end, _) => end,
        }
    }

    /// Do the final bookkeeping for this end and turn it into the session
    /// result. A local shutdown notifies the peer with CLEANUP first.
    pub async fn finish(self, sender: &ControlSender) -> Result<()> {
        match self {
            SessionEnd::Cleanup => {
                info!("recv exit signal from peer, exit now");
                Ok(())
            }
            SessionEnd::Cancelled => {
                if let Err(e) = sender.send(ControlMessage::cleanup()).await {
                    warn!("send cleanup failed: {e}");
                }
                let _ = sender.shutdown().await;
                info!("cleanup sent, exit now");
                Ok(())
            }
            SessionEnd::Lost(e) => {
                warn!("control connection lost: {e}");
                Err(Error::ControlClosed)
            }
        }
    }
}

pub(crate) fn join_failure(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(e))
}
