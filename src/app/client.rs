use chrono::{DateTime, Utc};
use http::Uri;
use k8s_openapi::apimachinery::pkg::version::Info;
use thiserror::Error;
use tracing::debug;

use super::eks::ClusterDescriptor;
use super::token::SignedToken;

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("Token was signed for cluster {signed} but the descriptor is for cluster {described}")]
    ClusterMismatch { described: String, signed: String },

    #[error("Cluster endpoint {endpoint:?} is not a valid https URL: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Cluster certificate authority could not be used as a trust anchor: {reason}")]
    TrustConfigurationError { reason: String },
}

/// An authenticated client for one cluster's API server.
///
/// Holds the token only inside the kube client's auth layer. Drop it when the
/// invocation ends; the token expires within minutes anyway.
#[derive(Clone)]
pub struct ClientHandle {
    endpoint: Uri,
    cluster_identifier: String,
    token: SignedToken,
    client: kube::Client,
}

impl ClientHandle {
    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    pub fn cluster_identifier(&self) -> &str {
        &self.cluster_identifier
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.token.expires_at()
    }

    pub fn token(&self) -> &SignedToken {
        &self.token
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }

    pub fn into_client(self) -> kube::Client {
        self.client
    }

    /// Ask the API server for its version, proving the token and CA both work.
    pub async fn server_version(&self) -> Result<Info, kube::Error> {
        self.client.apiserver_version().await
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("endpoint", &self.endpoint)
            .field("cluster_identifier", &self.cluster_identifier)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Build a client for `descriptor` that authenticates with `token`.
///
/// The cluster CA is the only trust anchor: `root_cert` replaces the system
/// roots in kube's TLS setup. Must run inside a Tokio runtime; kube spawns
/// its request buffer on it.
pub fn assemble(
    descriptor: &ClusterDescriptor,
    token: &SignedToken,
) -> Result<ClientHandle, AssembleError> {
    if descriptor.cluster_identifier != token.cluster_id() {
        return Err(AssembleError::ClusterMismatch {
            described: descriptor.cluster_identifier.clone(),
            signed: token.cluster_id().to_string(),
        });
    }

    let endpoint = parse_endpoint(&descriptor.endpoint_url)?;
    let root_certs = parse_ca_bundle(&descriptor.ca_certificate)?;

    let mut config = kube::Config::new(endpoint.clone());
    config.root_cert = Some(root_certs);
    config.accept_invalid_certs = false;
    config.auth_info.token = Some(token.value().to_secret_string());

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let client =
        kube::Client::try_from(config).map_err(|e| AssembleError::TrustConfigurationError {
            reason: e.to_string(),
        })?;

    debug!(%endpoint, cluster = %descriptor.cluster_identifier, "assembled cluster client");

    Ok(ClientHandle {
        endpoint,
        cluster_identifier: descriptor.cluster_identifier.clone(),
        token: token.clone(),
        client,
    })
}

fn parse_endpoint(endpoint_url: &str) -> Result<Uri, AssembleError> {
    let invalid = |reason: &str| AssembleError::InvalidEndpoint {
        endpoint: endpoint_url.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = endpoint_url
        .parse()
        .map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
    if uri.scheme_str() != Some("https") {
        return Err(invalid("scheme must be https"));
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(uri)
}

/// Split a PEM bundle into DER certificates, the form kube expects for `root_cert`.
fn parse_ca_bundle(pem_bytes: &[u8]) -> Result<Vec<Vec<u8>>, AssembleError> {
    let blocks = pem::parse_many(pem_bytes).map_err(|e| AssembleError::TrustConfigurationError {
        reason: e.to_string(),
    })?;

    let certs: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents())
        .collect();

    if certs.is_empty() {
        return Err(AssembleError::TrustConfigurationError {
            reason: "no CERTIFICATE block in the CA bundle".to_string(),
        });
    }
    Ok(certs)
}
