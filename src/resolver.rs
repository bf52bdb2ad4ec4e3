//! DNS query resolution logic.
//!
//! Handles the per-query pipeline:
//! 1. Cache lookup
//! 2. Try upstream candidates in ranked order, each under its own timeout
//! 3. Validate the answer; blocked answers and transport errors both move
//!    on to the next candidate
//! 4. Cache and return the first valid answer, or fail
//!
//! Transports handle the actual I/O, the resolver handles decisions. It is
//! the only writer of cache and registry state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{DEFAULT_TTL, DnsCache};
use crate::dns::{DnsQuery, DnsRecord, min_ttl};
use crate::error::UpstreamError;
use crate::filter::{BlockReason, IpValidator, Verdict};
use crate::integrations::{Event, Notifier};
use crate::upstream::{FailureKind, Outcome, Transition, UpstreamRegistry, UpstreamTransport};

/// Retry policy for one query.
#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    pub attempt_timeout: Duration,
    pub max_attempts: usize,
    /// Wall-clock limit across all attempts.
    pub budget: Duration,
    /// Upper bound for cached answer lifetimes.
    pub max_ttl: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(3),
            max_attempts: 4,
            budget: Duration::from_secs(8),
            max_ttl: DEFAULT_TTL,
        }
    }
}

/// How a single upstream attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    Answered,
    Blocked(BlockReason),
    Failed(UpstreamError),
}

#[derive(Debug)]
pub struct AttemptRecord {
    pub server: SocketAddr,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
}

/// Servers tried for one query and how each went. Dropped with the query.
#[derive(Debug, Default)]
pub struct ResolutionAttempt {
    pub attempts: Vec<AttemptRecord>,
    pub elapsed: Duration,
}

impl ResolutionAttempt {
    fn has_tried(&self, server: SocketAddr) -> bool {
        self.attempts.iter().any(|a| a.server == server)
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

/// Result of resolving one query.
#[derive(Debug)]
pub enum Resolution {
    Cached(Vec<DnsRecord>),
    Resolved {
        answers: Vec<DnsRecord>,
        server: SocketAddr,
        /// True when the answer came from a server other than the primary.
        fallback: bool,
        /// The upstream reply had TC set; `answers` is incomplete.
        truncated: bool,
        attempt: ResolutionAttempt,
    },
    Failed(ResolutionAttempt),
}

impl Resolution {
    pub fn answers(&self) -> Option<&[DnsRecord]> {
        match self {
            Self::Cached(answers) | Self::Resolved { answers, .. } => Some(answers),
            Self::Failed(_) => None,
        }
    }

    /// Wire response for `query`: the answers, or SERVFAIL.
    ///
    /// An incomplete upstream answer keeps the TC bit so the client knows.
    pub fn encode(&self, query: &DnsQuery) -> Vec<u8> {
        match self {
            Self::Resolved {
                answers,
                truncated: true,
                ..
            } => query.truncated_answer(answers),
            Self::Cached(answers) | Self::Resolved { answers, .. } => query.answer(answers),
            Self::Failed(_) => query.server_failure(),
        }
    }
}

/// Resolver handles DNS query processing decisions.
pub struct Resolver {
    cache: Arc<DnsCache>,
    registry: Arc<UpstreamRegistry>,
    validator: IpValidator,
    transport: Arc<dyn UpstreamTransport>,
    notifier: Arc<dyn Notifier>,
    settings: ResolverSettings,
}

impl Resolver {
    pub fn new(
        cache: Arc<DnsCache>,
        registry: Arc<UpstreamRegistry>,
        validator: IpValidator,
        transport: Arc<dyn UpstreamTransport>,
        notifier: Arc<dyn Notifier>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            cache,
            registry,
            validator,
            transport,
            notifier,
            settings,
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    pub fn registry(&self) -> &UpstreamRegistry {
        &self.registry
    }

    /// Resolve `query`. Never errors: exhaustion is a [`Resolution::Failed`].
    pub async fn resolve(&self, query: &DnsQuery) -> Resolution {
        let key = query.key();
        if let Some(answers) = self.cache.lookup(&key) {
            debug!(query = %key, records = answers.len(), "Cache hit");
            return Resolution::Cached(answers);
        }

        let started = Instant::now();
        let mut attempt = ResolutionAttempt::default();

        while attempt.len() < self.settings.max_attempts {
            let elapsed = started.elapsed();
            if elapsed >= self.settings.budget {
                debug!(query = %key, elapsed = ?elapsed, "Resolution budget spent");
                break;
            }

            // Re-rank every step; earlier failures may have taken servers down.
            let Some(server) = self
                .registry
                .select_candidates()
                .into_iter()
                .find(|s| !attempt.has_tried(*s))
            else {
                debug!(query = %key, "No untried upstream left");
                break;
            };

            let timeout = self.settings.attempt_timeout.min(self.settings.budget - elapsed);
            let sent = Instant::now();
            let result = self
                .transport
                .query(server, query, timeout)
                .await
                .and_then(|reply| {
                    // Nothing usable survived the cut; not evidence of blocking.
                    if reply.truncated && reply.answers.is_empty() {
                        Err(UpstreamError::Truncated { server })
                    } else {
                        Ok(reply)
                    }
                });
            let latency = sent.elapsed();
            let number = attempt.len() + 1;

            let outcome = match result {
                Ok(reply) => match self.validator.classify(&reply.answers) {
                    Verdict::Allowed => {
                        self.record(server, Outcome::Success { latency });

                        if reply.truncated {
                            debug!(query = %key, server = %server, records = reply.answers.len(), "Truncated answer, not caching");
                        } else {
                            let ttl = min_ttl(&reply.answers)
                                .map(|secs| Duration::from_secs(u64::from(secs)))
                                .unwrap_or(self.settings.max_ttl)
                                .clamp(Duration::from_secs(1), self.settings.max_ttl);
                            self.cache.store(key.clone(), reply.answers.clone(), ttl);
                        }

                        attempt.attempts.push(AttemptRecord {
                            server,
                            outcome: AttemptOutcome::Answered,
                            latency,
                        });
                        attempt.elapsed = started.elapsed();

                        let fallback = self.registry.primary() != Some(server);
                        if fallback {
                            info!(query = %key, server = %server, attempt = number, "Answered by fallback resolver");
                        } else {
                            debug!(query = %key, server = %server, latency = ?latency, "Answered by primary resolver");
                        }
                        return Resolution::Resolved {
                            answers: reply.answers,
                            server,
                            fallback,
                            truncated: reply.truncated,
                            attempt,
                        };
                    }
                    Verdict::Blocked(reason) => {
                        info!(query = %key, server = %server, attempt = number, %reason, "Blocked answer, trying next resolver");
                        self.record(server, Outcome::Failure(FailureKind::Blocked));
                        AttemptOutcome::Blocked(reason)
                    }
                },
                Err(err) => {
                    debug!(query = %key, server = %server, attempt = number, kind = err.kind(), error = %err, "Upstream attempt failed");
                    self.record(server, Outcome::Failure(FailureKind::Transport));
                    AttemptOutcome::Failed(err)
                }
            };

            attempt.attempts.push(AttemptRecord {
                server,
                outcome,
                latency,
            });
        }

        attempt.elapsed = started.elapsed();
        warn!(
            query = %key,
            attempts = attempt.len(),
            elapsed = ?attempt.elapsed,
            "Resolution failed, answering SERVFAIL"
        );
        Resolution::Failed(attempt)
    }

    fn record(&self, server: SocketAddr, outcome: Outcome) {
        if let Some(Transition::MarkedDown { until }) = self.registry.record_outcome(server, outcome) {
            let cooldown = until.saturating_duration_since(Instant::now());
            warn!(server = %server, cooldown = ?cooldown, "Upstream marked down");
            self.notifier.notify(Event::UpstreamDown {
                server,
                cooldown_secs: cooldown.as_secs(),
            });
        }
    }
}
