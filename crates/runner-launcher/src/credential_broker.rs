// CredentialBroker: exchanges a runner's access credential for a short-lived
// registration token, optionally deregistering stale runners first.

use crate::configurator::Configurator;
use crate::github_api::{ActionsApi, GitHubClient, RunnerScope};
use crate::provisioner;
use anyhow::Result;
use chrono::{DateTime, Utc};
use launcher_common::{LauncherContext, LauncherError, RunnerConfig, Tracing};
use launcher_sdk::TraceWriter;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// A registration token. The token itself is registered with the secret
/// masker as soon as it is issued.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationToken")
            .field("token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Input of one token exchange.
#[derive(Debug, Clone, Copy)]
pub struct TokenRequest<'a> {
    /// Effective runner name.
    pub runner: &'a str,
    pub config: &'a RunnerConfig,
    pub work_dir: &'a Path,
    pub access_token: &'a str,
}

#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: RegistrationToken,
    /// Non-fatal problems hit along the way (stale registration cleanup, quota).
    pub warnings: Vec<String>,
}

pub struct CredentialBroker {
    context: Arc<LauncherContext>,
    api: OnceCell<Arc<dyn ActionsApi>>,
    configurator: Configurator,
    trace: Tracing,
}

impl CredentialBroker {
    /// The API client is created on first use against the configured API URL.
    pub fn new(context: Arc<LauncherContext>) -> Self {
        Self::build(context, OnceCell::new())
    }

    pub fn with_api(context: Arc<LauncherContext>, api: Arc<dyn ActionsApi>) -> Self {
        Self::build(context, OnceCell::new_with(Some(api)))
    }

    fn build(context: Arc<LauncherContext>, api: OnceCell<Arc<dyn ActionsApi>>) -> Self {
        Self {
            trace: context.get_trace("CredentialBroker"),
            configurator: Configurator::new(context.clone()),
            context,
            api,
        }
    }

    /// The shared client, created exactly once even under concurrent first use.
    async fn api(&self, access_token: &str) -> Result<&Arc<dyn ActionsApi>> {
        self.api
            .get_or_try_init(|| async {
                let api_url = &self.context.settings().api_url;
                self.trace.verbose(&format!("Creating GitHub API client for {api_url}"));
                let client = GitHubClient::new(api_url)?;
                match client.authenticated_user(access_token).await {
                    Ok(login) => self.trace.info(&format!("Authenticated as {login}")),
                    Err(e) => self
                        .trace
                        .verbose(&format!("Could not look up the authenticated user: {e:#}")),
                }
                Ok::<_, anyhow::Error>(Arc::new(client) as Arc<dyn ActionsApi>)
            })
            .await
    }

    /// Obtain a registration token for one runner.
    ///
    /// Errors are `LauncherError::InvalidRepoUrl` or
    /// `LauncherError::TokenIssuanceFailed`; stale registration cleanup never fails the call.
    pub async fn obtain_runner_token(
        &self,
        request: TokenRequest<'_>,
        cancellation_token: CancellationToken,
    ) -> Result<TokenGrant> {
        let trace = self.trace.for_runner(request.runner);
        self.context.secret_masker().add_value(request.access_token);

        let scope = RunnerScope::for_runner(request.config)?;
        trace.verbose(&format!("Token scope is {scope}"));

        let api = self.api(request.access_token).await.map_err(|e| {
            LauncherError::TokenIssuanceFailed {
                reason: format!("{e:#}"),
            }
        })?;

        let mut warnings = Vec::new();
        if self.context.settings().remove_existing {
            self.remove_existing(&trace, api.as_ref(), &scope, &request, &mut warnings, cancellation_token)
                .await;
        }

        let response = api
            .create_registration_token(request.access_token, &scope)
            .await
            .map_err(|e| LauncherError::TokenIssuanceFailed {
                reason: format!("{e:#}"),
            })?;

        let issued = response.body;
        if issued.token.trim().is_empty() {
            return Err(LauncherError::TokenIssuanceFailed {
                reason: "the API returned an empty token".to_string(),
            }
            .into());
        }
        self.context.secret_masker().add_value(&issued.token);

        if let Some(rate) = response.rate {
            trace.verbose(&rate.to_string());
            if rate.is_low() {
                let warning = format!("Only {rate}");
                trace.warning(&warning);
                warnings.push(warning);
            }
        }

        match issued.expires_at {
            Some(expiry) => trace.info(&format!(
                "Obtained registration token (expires {})",
                expiry.to_rfc3339()
            )),
            None => trace.info("Obtained registration token"),
        }

        Ok(TokenGrant {
            token: RegistrationToken {
                token: issued.token,
                expires_at: issued.expires_at,
            },
            warnings,
        })
    }

    /// Deregister runners registered under this runner's name. Every failure
    /// here is recorded as a warning.
    async fn remove_existing(
        &self,
        trace: &Tracing,
        api: &dyn ActionsApi,
        scope: &RunnerScope,
        request: &TokenRequest<'_>,
        warnings: &mut Vec<String>,
        cancellation_token: CancellationToken,
    ) {
        let mut warn = |message: String| {
            trace.warning(&message);
            warnings.push(message);
        };

        trace.info(&format!("Removing existing registrations of {}", request.runner));

        match api.create_remove_token(request.access_token, scope).await {
            Ok(response) => {
                let remove_token = response.body.token;
                self.context.secret_masker().add_value(&remove_token);
                if !remove_token.is_empty() && provisioner::is_installed(request.work_dir) {
                    if let Err(e) = self
                        .configurator
                        .remove_local_registration(
                            request.runner,
                            request.work_dir,
                            &remove_token,
                            cancellation_token,
                        )
                        .await
                    {
                        warn(format!("Failed to remove local registration: {e:#}"));
                    }
                }
            }
            Err(e) => warn(format!("Failed to get a remove token: {e:#}")),
        }

        let registered = match api.list_runners(request.access_token, scope).await {
            Ok(response) => response.body,
            Err(e) => {
                warn(format!("Failed to list registered runners: {e:#}"));
                return;
            }
        };

        for stale in registered.iter().filter(|r| r.name == request.runner) {
            match api.delete_runner(request.access_token, scope, stale.id).await {
                Ok(()) => trace.info(&format!(
                    "Removed registered runner {} (id {}, {})",
                    stale.name, stale.id, stale.status
                )),
                Err(e) => warn(format!(
                    "Failed to remove registered runner {} (id {}): {e:#}",
                    stale.name, stale.id
                )),
            }
        }
    }
}
