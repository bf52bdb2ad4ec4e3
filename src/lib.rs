//! Sidestep - a local DNS proxy that routes around censored answers.
//!
//! Queries are answered from cache or forwarded to the host's original
//! resolver. Answers that look like interception (loopback, private or
//! reserved addresses, known ISP redirect pages, empty answers) are
//! discarded and the query is retried through a ranked pool of public
//! fallback resolvers.

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod integrations;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod transport;
pub mod upstream;
