//! Control surfaces over the background services
//!
//! The orchestrator drives two services as a pair:
//! - the native anonymity core (configure, start as client, stop)
//! - the packet-interception tunnel that routes device traffic through it
//!
//! Both are opaque. The core reports its own termination out of band via a
//! `CoreStopped` event; `stop_client` only asks it to go.

mod core_process;
mod process;
mod tunnel_process;

pub use core_process::ProcessCore;
pub use process::{ManagedProcess, ProcessState};
pub use tunnel_process::ProcessTunnel;

use crate::config::ClientConfig;
use crate::Result;
use async_trait::async_trait;

/// Native anonymity core
#[async_trait]
pub trait CoreHandle: Send + Sync {
    fn set_relay_address(&self, host: &str);

    fn set_relay_port(&self, port: u16);

    fn set_socks_port(&self, port: u16);

    fn set_disconnect_on_error(&self, enabled: bool);

    /// Apply a whole client config
    fn configure(&self, config: &ClientConfig) {
        self.set_relay_address(&config.relay_host);
        self.set_relay_port(config.relay_port);
        self.set_socks_port(config.socks_port);
        self.set_disconnect_on_error(config.disconnect_on_error);
    }

    async fn start_as_client(&self) -> Result<()>;

    /// Fire-and-forget; completion arrives later as a `CoreStopped` event
    async fn stop_client(&self);

    fn is_running(&self) -> bool;
}

/// Packet-interception service
#[async_trait]
pub trait TunnelHandle: Send + Sync {
    async fn start(&self, tag: &str) -> Result<()>;

    /// Stop the service. `force` skips the graceful shutdown.
    async fn stop(&self, tag: &str, force: bool) -> Result<()>;
}
