//! Bearer-token lifecycle shared by the export and poll pipelines, per
//! spec.md §4.6.

use crate::catalog::CatalogRepo;
use crate::error::DrawClientError;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<String>,
}

pub struct TokenManager {
    client: reqwest::Client,
    repo: CatalogRepo,
}

impl TokenManager {
    pub fn new(client: reqwest::Client, repo: CatalogRepo) -> Self {
        Self { client, repo }
    }

    /// Returns a bearer token valid for immediate use, refreshing first if
    /// `now >= token_expiry` or expiry is unknown. No in-memory token cache:
    /// the `SystemConfiguration` row is the single source of truth so a
    /// refresh performed by either pipeline is immediately visible to the
    /// other, per spec.md §5.
    pub async fn ensure_valid(&self) -> Result<String, DrawClientError> {
        let config = self
            .repo
            .get_system_configuration()
            .await?
            .ok_or_else(|| DrawClientError::ConfigurationMissing("system_configuration".to_string()))?;

        let needs_refresh = match (&config.bearer_token, config.token_expiry) {
            (Some(_), Some(expiry)) => OffsetDateTime::now_utc() >= expiry,
            _ => true,
        };

        if needs_refresh {
            self.refresh(&config.base_url, &config.token_refresh_endpoint, config.refresh_token.as_deref())
                .await?;
        }

        let refreshed = self
            .repo
            .get_system_configuration()
            .await?
            .ok_or_else(|| DrawClientError::ConfigurationMissing("system_configuration".to_string()))?;
        refreshed
            .bearer_token
            .ok_or_else(|| DrawClientError::AuthenticationFailed("no bearer token after refresh".to_string()))
    }

    /// Execute the refresh call exactly once. Per spec.md §4.6, the caller
    /// must not retry more than once per call.
    async fn refresh(
        &self,
        base_url: &str,
        token_refresh_endpoint: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), DrawClientError> {
        let refresh_token = refresh_token
            .ok_or_else(|| DrawClientError::AuthenticationFailed("no refresh token configured".to_string()))?;

        let url = format!("{base_url}{token_refresh_endpoint}");
        let response = self
            .client
            .post(&url)
            .bearer_auth(refresh_token)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| DrawClientError::AuthenticationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DrawClientError::AuthenticationFailed(format!(
                "token refresh returned {}",
                response.status()
            )));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| DrawClientError::AuthenticationFailed(e.to_string()))?;

        let expiry = if let Some(expires_in) = body.expires_in {
            OffsetDateTime::now_utc() + Duration::seconds(expires_in)
        } else if let Some(expires_at) = &body.expires_at {
            time::OffsetDateTime::parse(expires_at, &time::format_description::well_known::Iso8601::DEFAULT)
                .map_err(|e| DrawClientError::AuthenticationFailed(e.to_string()))?
        } else {
            return Err(DrawClientError::AuthenticationFailed(
                "refresh response missing expires_in/expires_at".to_string(),
            ));
        };

        self.repo
            .update_bearer_token(&body.access_token, body.refresh_token.as_deref(), expiry)
            .await?;
        Ok(())
    }

    /// Perform `call` with a valid bearer token; on a 401 mid-call, refresh
    /// exactly once and retry `call` exactly once more. Any further 401 is a
    /// hard failure, per spec.md §4.6. Used by every authenticated call the
    /// export and poll pipelines make against the remote service.
    pub async fn call_with_401_retry<T, F, Fut>(&self, call: F) -> Result<T, DrawClientError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, reqwest::Error>>,
    {
        let token = self.ensure_valid().await?;
        match call(token).await {
            Ok(v) => Ok(v),
            Err(e) if e.status() == Some(reqwest::StatusCode::UNAUTHORIZED) => {
                let config = self
                    .repo
                    .get_system_configuration()
                    .await?
                    .ok_or_else(|| DrawClientError::ConfigurationMissing("system_configuration".to_string()))?;
                self.refresh(&config.base_url, &config.token_refresh_endpoint, config.refresh_token.as_deref())
                    .await?;
                let token = self.ensure_valid().await?;
                match call(token).await {
                    Ok(v) => Ok(v),
                    Err(e2) if e2.status() == Some(reqwest::StatusCode::UNAUTHORIZED) => Err(
                        DrawClientError::AuthenticationFailed("repeated 401 after token refresh".to_string()),
                    ),
                    Err(e2) => Err(e2.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
