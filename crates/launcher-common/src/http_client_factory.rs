// HttpClientFactory: builds the reqwest clients used for API calls and
// archive downloads.

use crate::constants::variables;
use anyhow::{Context, Result};
use launcher_sdk::{LauncherPackage, StringUtil};
use reqwest::Client;
use std::time::Duration;

/// Creates HTTP clients with the launcher's user agent and TLS policy.
///
/// Proxies are taken from `HTTP_PROXY` / `HTTPS_PROXY` / `NO_PROXY`, which
/// reqwest honours on its own.
pub struct HttpClientFactory;

impl HttpClientFactory {
    /// Connection establishment timeout. Transfers themselves are not bounded.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a client. If `GITHUB_ACTIONS_RUNNER_TLS_NO_VERIFY` is truthy,
    /// certificate verification is disabled.
    pub fn create_client() -> Result<Client> {
        let tls_no_verify = std::env::var(variables::TLS_NO_VERIFY)
            .map(|v| StringUtil::is_truthy(&v))
            .unwrap_or(false);
        Self::build(tls_no_verify)
    }

    fn build(tls_no_verify: bool) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent(LauncherPackage::user_agent())
            .connect_timeout(Self::CONNECT_TIMEOUT);

        if tls_no_verify {
            tracing::warn!(
                "{} is set, TLS certificates will not be verified",
                variables::TLS_NO_VERIFY
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().context("Failed to build HTTP client")
    }
}
