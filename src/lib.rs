//! PriFi Proxy - client lifecycle orchestrator
//!
//! Control plane of the PriFi anonymity proxy client. It decides when the
//! anonymity tunnel may start, probes the relay before committing resources,
//! obtains the host's tunneling grant, drives the native core and the
//! packet-interception service in the right order, and reconciles their
//! asynchronous stop notifications into one published state.
//!
//! # Architecture
//!
//! ```text
//!          start() / stop()          status stream
//!                |                        ^
//!        +-------v------------------------+-------+
//!        |        orchestrator/ (control task)    |
//!        +---+-----------+-----------+------------+
//!            |           |           |        ^
//!     +------v--+  +-----v----+  +---v------+ |
//!     | grant/  |  |  probe/  |  | actuator | |
//!     +----+----+  +-----+----+  +---+------+ |
//!          |             |           |        |
//!          |             |     +-----v------+ |
//!          |             |     |  service/  | |
//!          |             |     | core+tunnel| |
//!          |             |     +-----+------+ |
//!          |             |           |        |
//!        +-v-------------v-----------v--------+-+
//!        |            event/ (bus)              |
//!        +--------------------------------------+
//! ```
//!
//! The anonymity protocol itself and the packet filtering rules live in the
//! external services; this crate only starts, stops and supervises them.

pub mod common;
pub mod config;
pub mod event;
pub mod grant;
pub mod orchestrator;
pub mod probe;
pub mod service;

pub use common::error::{Error, Result};
pub use config::{ClientConfig, Config};
pub use orchestrator::{
    Collaborators, FailureReason, Orchestrator, OrchestratorOptions, Rejected, RunState, Status,
};

use config::FileSettings;
use event::EventBus;
use grant::GrantGateway;
use probe::TcpProber;
use service::{ProcessCore, ProcessTunnel};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire the process-backed services from a config file and spawn the
/// orchestrator.
///
/// Client settings are re-read from `config_path` at every start attempt.
pub fn launch(config: &Config, config_path: impl Into<PathBuf>) -> (Orchestrator, JoinHandle<()>) {
    let bus = EventBus::new();

    let collaborators = Collaborators {
        core: Arc::new(ProcessCore::new(config.core.clone(), bus.sender())),
        tunnel: Arc::new(ProcessTunnel::new(config.tunnel.clone())),
        prober: Arc::new(TcpProber::new()),
        grants: Arc::new(GrantGateway::from_policy(config.grant.policy)),
        settings: Arc::new(FileSettings::new(config_path)),
    };

    let options = OrchestratorOptions {
        probe_timeout: config.probe.timeout(),
        ..Default::default()
    };

    Orchestrator::spawn(bus, collaborators, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.4.0");
    }

    #[tokio::test]
    async fn test_launch_starts_idle() {
        let config = Config::from_str(
            "core:\n  executable: prifi-core\ntunnel:\n  executable: prifi-tunnel\n",
        )
        .unwrap();
        let (orchestrator, handle) = launch(&config, "/nonexistent/prifi.yaml");

        assert_eq!(orchestrator.status().state, RunState::Idle);
        // No client section on disk
        assert_eq!(orchestrator.start().await, Err(Rejected::NoConfig));

        orchestrator.shutdown().await;
        handle.await.unwrap();
    }
}
