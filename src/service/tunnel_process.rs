//! Packet-interception service running as a child process

use super::process::ManagedProcess;
use super::TunnelHandle;
use crate::config::ProcessConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use tracing::{info, warn};

pub struct ProcessTunnel {
    process: ManagedProcess,
}

impl ProcessTunnel {
    pub fn new(config: ProcessConfig) -> Self {
        ProcessTunnel {
            process: ManagedProcess::new("tunnel", config),
        }
    }
}

#[async_trait]
impl TunnelHandle for ProcessTunnel {
    async fn start(&self, tag: &str) -> Result<()> {
        info!("Starting tunnel ({})", tag);
        let tag_owned = tag.to_string();
        self.process
            .spawn(vec!["--tag".to_string(), tag.to_string()], move |status| {
                // The orchestrator tears the tunnel down itself; an exit it
                // did not ask for only leaves a trace in the log
                if !status.map(|s| s.success()).unwrap_or(false) {
                    warn!("Tunnel ({}) exited: {:?}", tag_owned, status);
                }
            })
            .await
            .map_err(|e| Error::tunnel(e.to_string()))
    }

    async fn stop(&self, tag: &str, force: bool) -> Result<()> {
        info!("Stopping tunnel ({}, force: {})", tag, force);
        self.process.stop(force).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_missing_executable() {
        let tunnel = ProcessTunnel::new(ProcessConfig::new("/nonexistent/prifi-tunnel"));
        let err = tunnel.start("main").await.unwrap_err();
        assert!(matches!(err, Error::Tunnel(_)));
        assert!(!tunnel.process.is_running());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let tunnel = ProcessTunnel::new(ProcessConfig::new("prifi-tunnel"));
        assert!(tunnel.stop("main", false).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_force_stop() {
        let config = ProcessConfig {
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            startup_grace_ms: 100,
            ..ProcessConfig::new("sh")
        };
        let tunnel = ProcessTunnel::new(config);

        tunnel.start("main").await.unwrap();
        assert!(tunnel.process.is_running());

        tunnel.stop("main", true).await.unwrap();
        assert!(!tunnel.process.is_running());
    }
}
