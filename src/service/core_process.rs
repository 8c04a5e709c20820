//! Anonymity core running as a child process

use super::process::ManagedProcess;
use super::CoreHandle;
use crate::config::ProcessConfig;
use crate::event::EventSender;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Settings handed to the core on the next start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CoreSettings {
    relay_host: String,
    relay_port: u16,
    socks_port: u16,
    disconnect_on_error: bool,
}

impl CoreSettings {
    fn to_args(&self) -> Vec<String> {
        vec![
            "--relay-host".to_string(),
            self.relay_host.clone(),
            "--relay-port".to_string(),
            self.relay_port.to_string(),
            "--socks-port".to_string(),
            self.socks_port.to_string(),
            "--disconnect-on-error".to_string(),
            self.disconnect_on_error.to_string(),
        ]
    }
}

/// Core handle backed by a child process.
///
/// Every exit of the child, requested or not, is announced on the event bus
/// as a single `CoreStopped` notification.
pub struct ProcessCore {
    process: ManagedProcess,
    settings: Mutex<CoreSettings>,
    events: EventSender,
}

impl ProcessCore {
    pub fn new(config: ProcessConfig, events: EventSender) -> Self {
        ProcessCore {
            process: ManagedProcess::new("core", config),
            settings: Mutex::new(CoreSettings::default()),
            events,
        }
    }

    fn args(&self) -> Vec<String> {
        self.settings.lock().to_args()
    }
}

#[async_trait]
impl CoreHandle for ProcessCore {
    fn set_relay_address(&self, host: &str) {
        self.settings.lock().relay_host = host.to_string();
    }

    fn set_relay_port(&self, port: u16) {
        self.settings.lock().relay_port = port;
    }

    fn set_socks_port(&self, port: u16) {
        self.settings.lock().socks_port = port;
    }

    fn set_disconnect_on_error(&self, enabled: bool) {
        self.settings.lock().disconnect_on_error = enabled;
    }

    async fn start_as_client(&self) -> Result<()> {
        let settings = self.settings.lock().clone();
        if settings.relay_host.is_empty() || settings.relay_port == 0 || settings.socks_port == 0 {
            return Err(Error::core("core is not configured"));
        }

        info!(
            "Starting core as client of {}:{} (socks {})",
            settings.relay_host, settings.relay_port, settings.socks_port
        );

        let events = self.events.clone();
        self.process
            .spawn(self.args(), move |status| {
                debug!("Core exit status: {:?}", status);
                events.core_stopped();
            })
            .await
            .map_err(|e| Error::core(e.to_string()))
    }

    async fn stop_client(&self) {
        if !self.process.request_stop(false) {
            debug!("Core stop requested but no core process is running");
        }
    }

    fn is_running(&self) -> bool {
        self.process.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::event::{EventBus, EventKind};
    use std::time::Duration;

    fn core(executable: &str, bus: &EventBus) -> ProcessCore {
        let config = ProcessConfig {
            startup_grace_ms: 200,
            stop_timeout_ms: 1000,
            ..ProcessConfig::new(executable)
        };
        ProcessCore::new(config, bus.sender())
    }

    #[test]
    fn test_configure_uses_setters() {
        let bus = EventBus::new();
        let core = core("prifi-core", &bus);

        core.configure(&ClientConfig::new("10.0.0.1", 9000, 9001).with_disconnect_on_error(false));

        assert_eq!(
            core.args(),
            vec![
                "--relay-host", "10.0.0.1",
                "--relay-port", "9000",
                "--socks-port", "9001",
                "--disconnect-on-error", "false",
            ]
        );

        core.set_relay_port(9100);
        assert!(core.args().contains(&"9100".to_string()));
    }

    #[tokio::test]
    async fn test_start_unconfigured_fails() {
        let bus = EventBus::new();
        let core = core("prifi-core", &bus);
        let err = core.start_as_client().await.unwrap_err();
        assert!(matches!(err, Error::Core(_)));
        assert!(!core.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_is_reported_on_bus() {
        let bus = EventBus::new();
        // `sleep` rejects the generated flags, so use a shell that ignores them
        let config = ProcessConfig {
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            startup_grace_ms: 200,
            stop_timeout_ms: 1000,
            ..ProcessConfig::new("sh")
        };
        let core = ProcessCore::new(config, bus.sender());
        let (_own, mut rx) = bus.into_parts();

        core.configure(&ClientConfig::new("127.0.0.1", 9000, 9001));
        core.start_as_client().await.unwrap();
        assert!(core.is_running());

        core.stop_client().await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::CoreStopped);
        assert_eq!(event.attempt, None);
    }
}
