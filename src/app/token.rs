use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SignatureLocation, SigningSettings,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::aws::CredentialSource;

/// Scheme marker the EKS authenticator expects in front of the encoded URL.
pub const TOKEN_PREFIX: &str = "k8s-aws-v1.";

/// Header that binds the presigned request to one cluster.
pub const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";

const STS_SERVICE: &str = "sts";

/// Lifetime of the presigned URL itself, sent as `X-Amz-Expires`.
const PRESIGN_EXPIRY: std::time::Duration = std::time::Duration::from_secs(60);

/// EKS honours a presigned token for 15 minutes; report a minute less.
const TOKEN_LIFETIME_MINUTES: i64 = 14;

#[derive(Error, Debug)]
pub enum SignError {
    #[error("Cluster identifier is empty; refusing to sign an unscoped token")]
    EmptyClusterId,

    #[error("Unable to get credentials from the AWS credentials provider: {source}")]
    CredentialUnavailable {
        source: aws_credential_types::provider::error::CredentialsError,
    },

    #[error("Failed to sign the EKS authentication request: {0}")]
    SigningFailure(#[from] SigningFailure),
}

/// The ways building or signing the identity request can go wrong.
#[derive(Error, Debug)]
pub enum SigningFailure {
    #[error("failed to build the signing params: {source}")]
    BuildSigningParams {
        source: aws_sigv4::sign::v4::signing_params::BuildError,
    },

    #[error("failed to build the HTTP request: {source}")]
    BuildHttpRequest { source: http::Error },

    #[error("failed to create a signable request: {source}")]
    CreateSignableRequest {
        source: aws_sigv4::http_request::SigningError,
    },

    #[error("failed to sign the HTTP request: {source}")]
    SignHttpRequest {
        source: aws_sigv4::http_request::SigningError,
    },
}

/// Bearer token value. Never printed: `Debug` is redacted and there is no `Display`.
#[derive(Clone)]
pub struct TokenSecret(SecretString);

impl TokenSecret {
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub(crate) fn to_secret_string(&self) -> SecretString {
        SecretString::from(self.expose().to_string())
    }
}

impl std::fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSecret([REDACTED])")
    }
}

/// A presigned `GetCallerIdentity` request encoded as a bearer token for one cluster.
#[derive(Clone)]
pub struct SignedToken {
    value: TokenSecret,
    cluster_id: String,
    signed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl SignedToken {
    pub fn value(&self) -> &TokenSecret {
        &self.value
    }

    /// The cluster identifier embedded in the signed request.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn signed_at(&self) -> DateTime<Utc> {
        self.signed_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn to_exec_credential(&self) -> ExecCredential {
        ExecCredential {
            kind: "ExecCredential".to_string(),
            api_version: "client.authentication.k8s.io/v1beta1".to_string(),
            spec: HashMap::new(),
            status: ExecCredentialStatus {
                expiration_timestamp: self
                    .expires_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
                token: self.value.expose().to_string(),
            },
        }
    }
}

impl std::fmt::Debug for SignedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedToken")
            .field("cluster_id", &self.cluster_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Output document for kubectl's exec credential plugin protocol.
#[derive(Debug, Deserialize, Serialize)]
pub struct ExecCredential {
    pub kind: String,
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub spec: HashMap<String, ()>,
    pub status: ExecCredentialStatus,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ExecCredentialStatus {
    #[serde(rename = "expirationTimestamp")]
    pub expiration_timestamp: String,
    pub token: String,
}

/// Source of signing times. SigV4 dates have one second resolution, so two
/// tokens signed in the same second with the same credentials are identical.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Signs STS identity requests for EKS clusters in one region.
///
/// Signing is local: no request is sent, the API server verifies the
/// presigned URL against STS when the token is presented.
pub struct TokenSigner<'a> {
    credentials: &'a dyn CredentialSource,
    region: String,
    clock: Clock,
}

impl<'a> TokenSigner<'a> {
    pub fn new(credentials: &'a dyn CredentialSource, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn sign(&self, cluster_id: &str) -> Result<SignedToken, SignError> {
        self.sign_at(cluster_id, (self.clock)()).await
    }

    pub async fn sign_at(
        &self,
        cluster_id: &str,
        signed_at: DateTime<Utc>,
    ) -> Result<SignedToken, SignError> {
        if cluster_id.is_empty() {
            return Err(SignError::EmptyClusterId);
        }

        let identity = self.credentials.credentials().await?.into();

        let mut signing_settings = SigningSettings::default();
        signing_settings.signature_location = SignatureLocation::QueryParams;
        signing_settings.expires_in = Some(PRESIGN_EXPIRY);
        let signing_params = aws_sigv4::sign::v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(STS_SERVICE)
            .time(signed_at.into())
            .settings(signing_settings)
            .build()
            .map_err(|source| SigningFailure::BuildSigningParams { source })?
            .into();

        let uri = sts_identity_uri(&self.region);

        let mut request = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header(CLUSTER_ID_HEADER, cluster_id)
            .body(())
            .map_err(|source| SigningFailure::BuildHttpRequest { source })?;

        let signable_request = SignableRequest::new(
            "GET",
            uri.as_str(),
            std::iter::once((CLUSTER_ID_HEADER, cluster_id)),
            SignableBody::Bytes(&[]),
        )
        .map_err(|source| SigningFailure::CreateSignableRequest { source })?;

        let (signing_instructions, _signature) = sign(signable_request, &signing_params)
            .map_err(|source| SigningFailure::SignHttpRequest { source })?
            .into_parts();

        signing_instructions.apply_to_request_http1x(&mut request);

        let value = format!(
            "{}{}",
            TOKEN_PREFIX,
            URL_SAFE_NO_PAD.encode(request.uri().to_string())
        );
        let expires_at = signed_at + Duration::minutes(TOKEN_LIFETIME_MINUTES);

        debug!(cluster_id, %expires_at, "signed EKS token");

        Ok(SignedToken {
            value: TokenSecret(SecretString::from(value)),
            cluster_id: cluster_id.to_string(),
            signed_at,
            expires_at,
        })
    }
}

fn sts_identity_uri(region: &str) -> String {
    format!(
        "https://sts.{}.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15",
        region
    )
}
