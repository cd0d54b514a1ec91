use async_trait::async_trait;
use aws_sdk_eks::operation::describe_cluster::DescribeClusterError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::{debug, info};

use super::aws::load_sdk_config;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("EKS cluster {name} was not found in {region}")]
    ClusterNotFound { name: String, region: String },

    #[error("Failed to describe EKS cluster {name} in {region}: {source}")]
    DescribeFailure {
        name: String,
        region: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(
        "EKS cluster {name} returned certificate authority data that is not valid base64: {source}"
    )]
    MalformedCertificate {
        name: String,
        source: base64::DecodeError,
    },

    #[error("EKS cluster {name} description has no {field}")]
    IncompleteDescription { name: String, field: &'static str },
}

/// Cluster fields as the control plane reports them, before any decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMetadata {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub certificate_authority_data: Option<String>,
}

/// Where a cluster lives and which CA signs its serving certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub endpoint_url: String,
    /// PEM bundle, already base64-decoded.
    pub ca_certificate: Vec<u8>,
    pub cluster_identifier: String,
}

impl std::fmt::Debug for ClusterDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterDescriptor")
            .field("endpoint_url", &self.endpoint_url)
            .field("ca_certificate_len", &self.ca_certificate.len())
            .field("cluster_identifier", &self.cluster_identifier)
            .finish()
    }
}

/// The managed control-plane API, reduced to the one call the handshake needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn describe_cluster(
        &self,
        region: &str,
        name: &str,
    ) -> Result<ClusterMetadata, ResolveError>;
}

/// [`ControlPlane`] backed by the AWS EKS API.
#[derive(Debug, Clone, Default)]
pub struct EksControlPlane {
    profile: Option<String>,
}

impl EksControlPlane {
    pub fn new(profile: Option<String>) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl ControlPlane for EksControlPlane {
    async fn describe_cluster(
        &self,
        region: &str,
        name: &str,
    ) -> Result<ClusterMetadata, ResolveError> {
        let config = load_sdk_config(region, self.profile.as_deref()).await;
        let client = aws_sdk_eks::Client::new(&config);

        let output = client
            .describe_cluster()
            .name(name)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(DescribeClusterError::is_resource_not_found_exception)
                {
                    ResolveError::ClusterNotFound {
                        name: name.to_string(),
                        region: region.to_string(),
                    }
                } else {
                    ResolveError::DescribeFailure {
                        name: name.to_string(),
                        region: region.to_string(),
                        source: Box::new(err),
                    }
                }
            })?;

        let cluster = output.cluster().ok_or_else(|| ResolveError::ClusterNotFound {
            name: name.to_string(),
            region: region.to_string(),
        })?;

        Ok(ClusterMetadata {
            name: cluster.name().map(str::to_string),
            endpoint: cluster.endpoint().map(str::to_string),
            certificate_authority_data: cluster
                .certificate_authority()
                .and_then(|ca| ca.data())
                .map(str::to_string),
        })
    }
}

/// Look up `name` in `region` and decode what is needed to talk to its API server.
pub async fn resolve(
    control_plane: &dyn ControlPlane,
    name: &str,
    region: &str,
) -> Result<ClusterDescriptor, ResolveError> {
    info!(cluster = name, region, "describing EKS cluster");
    let metadata = control_plane.describe_cluster(region, name).await?;

    let endpoint_url = metadata
        .endpoint
        .filter(|endpoint| !endpoint.is_empty())
        .ok_or_else(|| ResolveError::IncompleteDescription {
            name: name.to_string(),
            field: "endpoint",
        })?;

    let ca_data = metadata
        .certificate_authority_data
        .ok_or_else(|| ResolveError::IncompleteDescription {
            name: name.to_string(),
            field: "certificate authority data",
        })?;

    let ca_certificate = STANDARD
        .decode(ca_data.trim())
        .map_err(|source| ResolveError::MalformedCertificate {
            name: name.to_string(),
            source,
        })?;

    let descriptor = ClusterDescriptor {
        endpoint_url,
        ca_certificate,
        cluster_identifier: metadata.name.unwrap_or_else(|| name.to_string()),
    };
    debug!(?descriptor, "resolved EKS cluster");

    Ok(descriptor)
}
