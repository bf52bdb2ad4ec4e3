//! Advisory content-safety assessment of queried domains.
//!
//! Assessment never sits on the resolution path: it runs after the
//! client has its answer, under its own timeout and concurrency limit,
//! and any failure counts as "allow".

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use super::notify::{Event, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyVerdict {
    Allow,
    Warn,
    Block,
}

impl fmt::Display for SafetyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Warn => f.write_str("warn"),
            Self::Block => f.write_str("block"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub verdict: SafetyVerdict,
    pub reason: String,
}

impl Assessment {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            verdict: SafetyVerdict::Allow,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait ContentSafety: Send + Sync {
    async fn assess(&self, domain: &str) -> Assessment;

    /// False for backends that never look at the domain.
    fn is_active(&self) -> bool {
        true
    }
}

/// Assessment turned off; everything is allowed.
#[derive(Debug, Default, Clone, Copy)]
pub struct Disabled;

#[async_trait]
impl ContentSafety for Disabled {
    async fn assess(&self, _domain: &str) -> Assessment {
        Assessment::allow("content checking disabled")
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// Runs assessments in the background and reports unsafe domains.
#[derive(Clone)]
pub struct SafetyMonitor {
    checker: Arc<dyn ContentSafety>,
    notifier: Arc<dyn Notifier>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl SafetyMonitor {
    pub fn new(
        checker: Arc<dyn ContentSafety>,
        notifier: Arc<dyn Notifier>,
        max_in_flight: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            checker,
            notifier,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            timeout,
        }
    }

    /// Whether the backend actually inspects domains.
    pub fn is_active(&self) -> bool {
        self.checker.is_active()
    }

    /// Start an assessment of `domain` without waiting for it. Returns
    /// whether a task was spawned.
    ///
    /// Skipped outright for an inactive backend or when too many
    /// assessments are already running.
    pub fn spawn_assessment(&self, domain: String) -> bool {
        if !self.is_active() {
            return false;
        }
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            debug!(domain, "Content check skipped, too many in flight");
            return false;
        };
        let monitor = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            monitor.assess(&domain).await;
        });
        true
    }

    /// Assess `domain`, notifying on anything other than "allow".
    pub async fn assess(&self, domain: &str) -> Assessment {
        let assessment = match tokio::time::timeout(self.timeout, self.checker.assess(domain)).await {
            Ok(assessment) => assessment,
            Err(_) => {
                debug!(domain, timeout = ?self.timeout, "Content check timed out");
                return Assessment::allow("content check timed out");
            }
        };

        if assessment.verdict != SafetyVerdict::Allow {
            self.notifier.notify(Event::UnsafeDomain {
                domain: domain.to_string(),
                verdict: assessment.verdict,
                reason: assessment.reason.clone(),
            });
        }
        assessment
    }
}
