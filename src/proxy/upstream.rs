//! Shared HTTP client for the Plan and Bedrock upstreams.
//!
//! No retry middleware: a failed Plan call is retried on Bedrock by the
//! router, and Bedrock failures go straight back to the caller.

use anyhow::Context;

use crate::config::Config;

/// One pooled client for the whole process.
///
/// `read_timeout` bounds the gap between bytes rather than the whole call,
/// so long streams stay open while tokens keep flowing.
pub fn build_http_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .pool_max_idle_per_host(32)
        .connect_timeout(config.http_connect_timeout)
        .read_timeout(config.http_read_timeout)
        .build()
        .context("failed to build upstream HTTP client")
}

/// How a `reqwest` transport failure should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    Network,
}

pub fn classify_transport(err: &reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        TransportFailure::Timeout
    } else {
        TransportFailure::Network
    }
}
