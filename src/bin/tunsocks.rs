use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;
use tokio_util::sync::CancellationToken;
use tunsocks::config::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS};
use tunsocks::{Config, LocalProxy, Relay, Secret, Socks5, TunnelClient};

#[derive(Parser, Debug)]
#[command(name = "tunsocks", about = "socks5 server reachable through a relay")]
struct Args {
    /// Seconds between heartbeats on the control channel
    #[arg(long, default_value_t = 30)]
    heartbeat: u64,

    /// Dial timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout: u64,

    /// Maximum concurrent connections; request queues hold half of it
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// 16 byte key for encrypted legs
    #[arg(long, env = "TUNSOCKS_SECRET", hide_env_values = true)]
    secret: Option<Secret>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve socks5 directly on a local port
    Proxy {
        #[arg(short, long)]
        listen: String,
        #[arg(short, long)]
        encrypt: bool,
    },
    /// Run socks5 behind NAT, reachable through a relay
    Connect {
        #[arg(short, long)]
        relay: String,
        #[arg(short, long)]
        encrypt: bool,
    },
    /// Accept the tunnel client on `master` and end users on `local`
    Relay {
        #[arg(short, long)]
        master: String,
        #[arg(short, long)]
        local: String,
        #[arg(long)]
        master_encrypt: bool,
        #[arg(long)]
        local_encrypt: bool,
    },
}

impl Args {
    fn config(&self) -> Config {
        Config {
            heartbeat_period: Duration::from_secs(self.heartbeat),
            max_connections: self.max_connections,
            dial_timeout: Duration::from_millis(self.timeout),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            secret: self.secret.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config();
    config.validate()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("recv ctrl+c, exit now");
                shutdown.cancel();
            }
        });
    }

    let socks5 = Socks5::new(config.dial_timeout);
    match args.mode {
        Mode::Proxy { listen, encrypt } => {
            let secret = config.leg_secret(encrypt)?;
            LocalProxy::bind(&listen, secret, socks5)
                .await?
                .run(shutdown)
                .await?;
        }
        Mode::Connect { relay, encrypt } => {
            TunnelClient::new(relay, config, encrypt, socks5)?
                .run(shutdown)
                .await?;
        }
        Mode::Relay {
            master,
            local,
            master_encrypt,
            local_encrypt,
        } => {
            Relay::bind(&master, &local, config, master_encrypt, local_encrypt)
                .await?
                .run(shutdown)
                .await?;
        }
    }

    Ok(())
}
