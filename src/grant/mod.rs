//! Tunneling capability grant
//!
//! The host must consent once before traffic interception may begin. The
//! gateway answers synchronously whether the grant is already held; when it
//! is not, it issues the request in the background and later posts exactly
//! one outcome on the event bus. Denials are never remembered.

use crate::config::GrantPolicy;
use crate::event::{AttemptId, EventKind, EventSender};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Grant lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Never requested, or revoked
    Absent,
    /// Request in flight
    Pending,
    Granted,
    Denied,
}

/// Terminal outcome of a grant request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted,
    Denied,
}

impl fmt::Display for GrantOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantOutcome::Granted => write!(f, "granted"),
            GrantOutcome::Denied => write!(f, "denied"),
        }
    }
}

/// Result of [`GrantGateway::check_or_request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantCheck {
    AlreadyGranted,
    RequestIssued,
}

/// Host mechanism behind the grant
#[async_trait]
pub trait GrantMechanism: Send + Sync {
    fn is_granted(&self) -> bool;

    /// Ask the user. May wait indefinitely.
    async fn request_grant(&self) -> GrantOutcome;
}

/// Fixed answer, used for headless hosts
#[derive(Debug)]
pub struct StaticGrant {
    granted: bool,
}

impl StaticGrant {
    pub fn granted() -> Self {
        StaticGrant { granted: true }
    }

    pub fn denied() -> Self {
        StaticGrant { granted: false }
    }
}

#[async_trait]
impl GrantMechanism for StaticGrant {
    fn is_granted(&self) -> bool {
        self.granted
    }

    async fn request_grant(&self) -> GrantOutcome {
        if self.granted {
            GrantOutcome::Granted
        } else {
            GrantOutcome::Denied
        }
    }
}

/// Asks on the controlling terminal. Consent lasts for the process lifetime
/// unless revoked.
#[derive(Debug, Default)]
pub struct PromptGrant {
    granted: AtomicBool,
}

impl PromptGrant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self) {
        self.granted.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl GrantMechanism for PromptGrant {
    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    async fn request_grant(&self) -> GrantOutcome {
        {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "Allow prifi-proxy to intercept device traffic? [y/N] ");
            let _ = stderr.flush();
        }

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = stdin.read_line(&mut line).await {
            warn!("Could not read grant answer: {}", e);
            return GrantOutcome::Denied;
        }

        if matches!(line.trim().to_lowercase().as_str(), "y" | "yes") {
            self.granted.store(true, Ordering::SeqCst);
            GrantOutcome::Granted
        } else {
            GrantOutcome::Denied
        }
    }
}

/// Build the mechanism for a configured policy
pub fn mechanism_for(policy: GrantPolicy) -> Arc<dyn GrantMechanism> {
    match policy {
        GrantPolicy::Auto => Arc::new(StaticGrant::granted()),
        GrantPolicy::Deny => Arc::new(StaticGrant::denied()),
        GrantPolicy::Prompt => Arc::new(PromptGrant::new()),
    }
}

/// Capability grant gateway
pub struct GrantGateway {
    mechanism: Arc<dyn GrantMechanism>,
    state: Arc<Mutex<Grant>>,
}

impl GrantGateway {
    pub fn new(mechanism: Arc<dyn GrantMechanism>) -> Self {
        GrantGateway {
            mechanism,
            state: Arc::new(Mutex::new(Grant::Absent)),
        }
    }

    pub fn from_policy(policy: GrantPolicy) -> Self {
        Self::new(mechanism_for(policy))
    }

    /// Current grant lifecycle state
    pub fn state(&self) -> Grant {
        *self.state.lock()
    }

    /// Check the grant, issuing a request when it is not held.
    ///
    /// On `RequestIssued` the outcome is posted later on `events` tagged with
    /// `attempt`. Must be called inside a tokio runtime.
    pub fn check_or_request(&self, attempt: AttemptId, events: &EventSender) -> GrantCheck {
        if self.mechanism.is_granted() {
            *self.state.lock() = Grant::Granted;
            return GrantCheck::AlreadyGranted;
        }

        *self.state.lock() = Grant::Pending;
        info!("Requesting tunneling capability (attempt {})", attempt);

        let mechanism = self.mechanism.clone();
        let state = self.state.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let outcome = mechanism.request_grant().await;
            *state.lock() = match outcome {
                GrantOutcome::Granted => Grant::Granted,
                GrantOutcome::Denied => Grant::Denied,
            };
            debug!("Grant request for attempt {} {}", attempt, outcome);
            events.attempt(attempt, EventKind::GrantResolved(outcome));
        });

        GrantCheck::RequestIssued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;

    #[tokio::test]
    async fn test_already_granted() {
        let bus = EventBus::new();
        let gateway = GrantGateway::from_policy(GrantPolicy::Auto);

        let check = gateway.check_or_request(1, &bus.sender());

        assert_eq!(check, GrantCheck::AlreadyGranted);
        assert_eq!(gateway.state(), Grant::Granted);
    }

    #[tokio::test]
    async fn test_denied_request_posts_outcome() {
        let bus = EventBus::new();
        let sender = bus.sender();
        let (_own, mut rx) = bus.into_parts();
        let gateway = GrantGateway::from_policy(GrantPolicy::Deny);

        assert_eq!(gateway.check_or_request(7, &sender), GrantCheck::RequestIssued);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.attempt, Some(7));
        assert_eq!(event.kind, EventKind::GrantResolved(GrantOutcome::Denied));
        assert_eq!(gateway.state(), Grant::Denied);
    }

    #[tokio::test]
    async fn test_denial_not_persisted() {
        let bus = EventBus::new();
        let sender = bus.sender();
        let (_own, mut rx) = bus.into_parts();
        let gateway = GrantGateway::from_policy(GrantPolicy::Deny);

        gateway.check_or_request(1, &sender);
        rx.recv().await.unwrap();

        // Next attempt asks again instead of reusing the denial
        assert_eq!(gateway.check_or_request(2, &sender), GrantCheck::RequestIssued);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.attempt, Some(2));
    }

    #[test]
    fn test_prompt_revoke() {
        let prompt = PromptGrant::new();
        assert!(!prompt.is_granted());
        prompt.granted.store(true, Ordering::SeqCst);
        assert!(prompt.is_granted());
        prompt.revoke();
        assert!(!prompt.is_granted());
    }
}
