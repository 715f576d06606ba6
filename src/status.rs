//! Per-component connection status.
//!
//! Every component owns one [`Reporter`]. The status is created at
//! component start as not running with reason "Initialising", overwritten on
//! every transition and forwarded to the presentation layer as an
//! [`Event::Status`].

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use crate::events::{self, Component, Event};

/// Running state of a component with a human-readable reason.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnectionStatus {
    pub running: bool,
    pub reason: String,
}

impl ConnectionStatus {
    pub const INITIALISING: &'static str = "Initialising";

    #[must_use]
    pub fn new(running: bool, reason: impl Into<String>) -> Self {
        Self {
            running,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.running { "running" } else { "stopped" };
        if self.reason.is_empty() {
            write!(f, "{state}")
        } else {
            write!(f, "{state} ({})", self.reason)
        }
    }
}

/// Shared handle on the status of one component.
///
/// Clones share the same status, so other components can read it (the feed
/// client checks whether presence is running before updating it).
#[derive(Clone, Debug)]
pub struct Reporter {
    component: Component,
    status: Arc<Mutex<ConnectionStatus>>,
    events: Option<events::Sender>,
}

impl Reporter {
    #[must_use]
    pub fn new(component: Component, events: Option<events::Sender>) -> Self {
        Self {
            component,
            status: Arc::new(Mutex::new(ConnectionStatus::new(
                false,
                ConnectionStatus::INITIALISING,
            ))),
            events,
        }
    }

    /// Overwrites the status and forwards it to the presentation layer.
    pub fn update(&self, running: bool, reason: impl Into<String>) {
        let status = ConnectionStatus::new(running, reason);
        {
            // A panic while holding this lock cannot leave the status torn:
            // it is replaced as a whole.
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *current != status {
                info!("{}: {status}", self.component);
            }
            current.clone_from(&status);
        }

        if let Some(events) = &self.events {
            // The presentation layer going away is not our concern.
            let _ = events.send(Event::Status {
                component: self.component,
                status,
            });
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_initialising() {
        let reporter = Reporter::new(Component::Feed, None);
        assert_eq!(
            reporter.status(),
            ConnectionStatus::new(false, ConnectionStatus::INITIALISING)
        );
    }

    #[test]
    fn update_is_shared_and_forwarded() {
        let (tx, mut rx) = events::channel();
        let reporter = Reporter::new(Component::Presence, Some(tx));
        let observer = reporter.clone();

        reporter.update(false, "Discord not found");
        assert!(!observer.is_running());
        assert_eq!(observer.status().reason, "Discord not found");

        assert_eq!(
            rx.try_recv().unwrap(),
            Event::Status {
                component: Component::Presence,
                status: ConnectionStatus::new(false, "Discord not found"),
            }
        );
    }

    #[test]
    fn display_includes_reason() {
        assert_eq!(
            ConnectionStatus::new(false, "connection closed").to_string(),
            "stopped (connection closed)"
        );
        assert_eq!(ConnectionStatus::new(true, "").to_string(), "running");
        assert_eq!(Component::Feed.to_string(), "Websocket");
    }
}
