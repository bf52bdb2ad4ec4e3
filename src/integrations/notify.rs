//! User-facing notifications.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use tracing::{error, info, warn};

use super::safety::SafetyVerdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ServiceStarted {
        primary: SocketAddr,
        fallbacks: usize,
    },
    ServiceStopped,
    ResolverChanged {
        from: String,
        to: IpAddr,
    },
    ResolverError(String),
    UpstreamDown {
        server: SocketAddr,
        cooldown_secs: u64,
    },
    UnsafeDomain {
        domain: String,
        verdict: SafetyVerdict,
        reason: String,
    },
}

impl Event {
    pub fn severity(&self) -> Severity {
        match self {
            Self::ServiceStarted { .. } | Self::ServiceStopped | Self::ResolverChanged { .. } => {
                Severity::Info
            }
            Self::UpstreamDown { .. } | Self::UnsafeDomain { .. } => Severity::Warning,
            Self::ResolverError(_) => Severity::Error,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } | Self::ServiceStopped => "Service Status Update",
            Self::ResolverChanged { .. } => "DNS Server Changed",
            Self::ResolverError(_) => "DNS Configuration Error",
            Self::UpstreamDown { .. } => "Upstream Resolver Down",
            Self::UnsafeDomain { .. } => "Unsafe Site Detected",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceStarted { primary, fallbacks } => {
                write!(f, "started with primary {primary} and {fallbacks} fallbacks")
            }
            Self::ServiceStopped => f.write_str("stopped"),
            Self::ResolverChanged { from, to } => write!(f, "DNS server changed from {from} to {to}"),
            Self::ResolverError(message) => f.write_str(message),
            Self::UpstreamDown {
                server,
                cooldown_secs,
            } => write!(f, "{server} skipped for {cooldown_secs}s after repeated failures"),
            Self::UnsafeDomain {
                domain,
                verdict,
                reason,
            } => write!(f, "{domain} assessed as {verdict}: {reason}"),
        }
    }
}

/// Delivers events to the user. Must return quickly and never fail.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event);
}

/// Writes events to the log at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: Event) {
        let title = event.title();
        match event.severity() {
            Severity::Info => info!(title, "{event}"),
            Severity::Warning => warn!(title, "{event}"),
            Severity::Error => error!(title, "{event}"),
        }
    }
}

/// Keeps every event in memory. Useful for tests and status reporting.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_matches_event_kind() {
        assert_eq!(Event::ServiceStopped.severity(), Severity::Info);
        assert_eq!(Event::ResolverError("boom".into()).severity(), Severity::Error);
        assert_eq!(
            Event::UpstreamDown {
                server: "8.8.8.8:53".parse().unwrap(),
                cooldown_secs: 30
            }
            .severity(),
            Severity::Warning
        );
    }

    #[test]
    fn recording_notifier_keeps_order() {
        let notifier = RecordingNotifier::new();

        notifier.notify(Event::ServiceStopped);
        notifier.notify(Event::ResolverError("x".into()));

        assert_eq!(
            notifier.events(),
            vec![Event::ServiceStopped, Event::ResolverError("x".into())]
        );
    }

    #[test]
    fn display_is_human_readable() {
        let event = Event::ResolverChanged {
            from: "192.168.1.1".into(),
            to: "127.0.0.1".parse().unwrap(),
        };

        assert_eq!(event.to_string(), "DNS server changed from 192.168.1.1 to 127.0.0.1");
        assert_eq!(event.title(), "DNS Server Changed");
    }
}
