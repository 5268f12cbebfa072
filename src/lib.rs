//! SOCKS5 reachable through a relay.
//!
//! A [`TunnelClient`] sitting behind NAT keeps one control connection open to a
//! public [`Relay`]. Each end user that connects to the relay turns into a
//! `CONNECT_ME` frame on that channel; the client answers by dialing a fresh
//! data connection back and serving socks5 on it, and the relay pipes the
//! two together. [`LocalProxy`] is the same socks5 server without the relay.

pub mod client;
pub mod config;
pub mod conn;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod local;
pub mod msg;
pub mod relay;
pub mod session;
pub mod socks5;

pub use client::TunnelClient;
pub use config::{Config, Secret};
pub use conn::Conn;
pub use error::{DecodeError, Error, Result};
pub use local::LocalProxy;
pub use relay::Relay;
pub use socks5::{Handler, Socks5};
