use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::Credentials;
use aws_types::region::Region;
use aws_types::SdkConfig;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use super::token::SignError;

/// Load the shared AWS configuration for `region`, optionally pinned to a named profile.
///
/// Credentials are resolved lazily by the default provider chain, so this never fails;
/// missing credentials surface when something asks for them.
pub async fn load_sdk_config(region: &str, profile: Option<&str>) -> SdkConfig {
    debug!(region, profile, "loading AWS shared config");

    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }
    loader.load().await
}

/// Source of the AWS credentials used to sign identity requests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self) -> Result<Credentials, SignError>;
}

/// Credentials discovered from the environment, profile files, IMDS or the
/// container credential endpoint, whatever the default chain finds first.
#[derive(Debug, Clone)]
pub struct AmbientCredentials {
    config: SdkConfig,
}

impl AmbientCredentials {
    pub fn new(config: SdkConfig) -> Self {
        Self { config }
    }

    pub async fn load(region: &str, profile: Option<&str>) -> Self {
        Self::new(load_sdk_config(region, profile).await)
    }
}

#[async_trait]
impl CredentialSource for AmbientCredentials {
    async fn credentials(&self) -> Result<Credentials, SignError> {
        let provider = self
            .config
            .credentials_provider()
            .ok_or_else(|| SignError::CredentialUnavailable {
                source: CredentialsError::not_loaded(
                    "no credentials provider in the shared config",
                ),
            })?;

        provider
            .provide_credentials()
            .await
            .map_err(|source| SignError::CredentialUnavailable { source })
    }
}

/// A fixed set of credentials, handy for tests and for callers that already hold keys.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials, SignError> {
        Ok(self.0.clone())
    }
}
