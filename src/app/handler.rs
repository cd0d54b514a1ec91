use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

use super::aws::CredentialSource;
use super::client::{assemble, AssembleError, ClientHandle};
use super::eks::{resolve, ControlPlane, ResolveError};
use super::logging::{invocation_dispatch, LogLevel};
use super::token::{system_clock, Clock, SignError, TokenSigner};
use super::DEFAULT_REGION;

/// The event as it arrives on the wire. Every field may be missing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEvent {
    #[serde(default)]
    pub kubernetes_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub log_level: String,
}

/// A validated event with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    cluster_name: String,
    region: String,
    log_level: LogLevel,
}

impl InvocationRequest {
    pub fn new(
        cluster_name: impl Into<String>,
        region: Option<String>,
        log_level: Option<LogLevel>,
    ) -> Result<Self, HandshakeError> {
        let cluster_name = cluster_name.into();
        if cluster_name.trim().is_empty() {
            return Err(HandshakeError::EmptyClusterName);
        }

        Ok(Self {
            cluster_name,
            region: region
                .map(|region| region.trim().to_string())
                .filter(|region| !region.is_empty())
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            log_level: log_level.unwrap_or_default(),
        })
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }
}

impl TryFrom<&InvocationEvent> for InvocationRequest {
    type Error = HandshakeError;

    fn try_from(event: &InvocationEvent) -> Result<Self, Self::Error> {
        let log_level = match event.log_level.trim() {
            "" => None,
            raw => match raw.parse::<LogLevel>() {
                Ok(level) => Some(level),
                Err(e) => {
                    warn!(error = %e, "falling back to info");
                    None
                }
            },
        };

        if event.region.trim().is_empty() {
            warn!(region = DEFAULT_REGION, "no region set, using default");
        }

        InvocationRequest::new(
            event.kubernetes_name.clone(),
            Some(event.region.clone()),
            log_level,
        )
    }
}

/// How a failure should be read by whoever invoked us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller sent something unusable.
    Input,
    /// AWS refused or could not be reached.
    Upstream,
    /// What AWS returned cannot be turned into a client.
    Configuration,
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Kubernetes cluster name is empty")]
    EmptyClusterName,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    Assemble(#[from] AssembleError),
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::EmptyClusterName => ErrorKind::Input,
            HandshakeError::Resolve(ResolveError::MalformedCertificate { .. })
            | HandshakeError::Resolve(ResolveError::IncompleteDescription { .. })
            | HandshakeError::Assemble(_) => ErrorKind::Configuration,
            HandshakeError::Resolve(_) | HandshakeError::Sign(_) => ErrorKind::Upstream,
        }
    }
}

/// Status phrases reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    #[serde(rename = "Success")]
    Success,
    #[serde(rename = "empty Kubernetes Name")]
    EmptyKubernetesName,
    #[serde(rename = "Error Describing Clusters")]
    ErrorDescribingClusters,
    #[serde(rename = "Error creating clientset")]
    ErrorCreatingClientset,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::EmptyKubernetesName => "empty Kubernetes Name",
            Status::ErrorDescribingClusters => "Error Describing Clusters",
            Status::ErrorCreatingClientset => "Error creating clientset",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one invocation: the status phrase, the error if one occurred,
/// and the client when everything worked.
#[derive(Debug)]
pub struct Outcome {
    pub status: Status,
    pub error: Option<HandshakeError>,
    pub client: Option<ClientHandle>,
}

impl Outcome {
    fn success(client: ClientHandle) -> Self {
        Self {
            status: Status::Success,
            error: None,
            client: Some(client),
        }
    }

    fn failed(status: Status, error: HandshakeError) -> Self {
        Self {
            status,
            error: Some(error),
            client: None,
        }
    }

    /// An empty cluster name is reported, not raised: the status says what
    /// was wrong and no error is attached.
    fn empty_name() -> Self {
        Self {
            status: Status::EmptyKubernetesName,
            error: None,
            client: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Only an upstream failure of the describe call counts as an error
    /// describing clusters; unusable cluster data, signing and assembly
    /// failures all mean no clientset could be built.
    fn from_error(error: HandshakeError) -> Self {
        let status = match &error {
            HandshakeError::EmptyClusterName => return Self::empty_name(),
            HandshakeError::Resolve(_) if error.kind() == ErrorKind::Upstream => {
                Status::ErrorDescribingClusters
            }
            _ => Status::ErrorCreatingClientset,
        };
        Self::failed(status, error)
    }

    /// The `(status, error)` pair callers see.
    pub fn into_parts(self) -> (Status, Option<HandshakeError>) {
        (self.status, self.error)
    }
}

/// Wires the three steps to their collaborators.
pub struct Handshake<'a> {
    control_plane: &'a dyn ControlPlane,
    credentials: &'a dyn CredentialSource,
    clock: Clock,
}

impl<'a> Handshake<'a> {
    pub fn new(
        control_plane: &'a dyn ControlPlane,
        credentials: &'a dyn CredentialSource,
    ) -> Self {
        Self {
            control_plane,
            credentials,
            clock: system_clock(),
        }
    }

    /// Use `clock` for the signing time of every token this handshake issues.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Handle a raw event, logging through a subscriber scoped to this invocation.
    pub async fn handle(&self, event: &InvocationEvent) -> Outcome {
        let level = event.log_level.parse::<LogLevel>().unwrap_or_default();
        self.handle_event(event)
            .with_subscriber(invocation_dispatch(level))
            .await
    }

    /// Handle a raw event using whatever subscriber is current.
    pub async fn handle_event(&self, event: &InvocationEvent) -> Outcome {
        match InvocationRequest::try_from(event) {
            Ok(request) => self.run(&request).await,
            Err(e) => {
                error!(error = %e, "empty cluster name in event");
                Outcome::empty_name()
            }
        }
    }

    pub async fn run(&self, request: &InvocationRequest) -> Outcome {
        info!(
            cluster = request.cluster_name(),
            region = request.region(),
            log_level = %request.log_level(),
            "starting EKS handshake"
        );

        let resolved = resolve(self.control_plane, request.cluster_name(), request.region()).await;
        let descriptor = match resolved {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(error = %e, "describing cluster failed");
                return Outcome::from_error(e.into());
            }
        };

        let signer =
            TokenSigner::new(self.credentials, request.region()).with_clock(self.clock.clone());
        let token = match signer.sign(&descriptor.cluster_identifier).await {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, "signing token failed");
                return Outcome::from_error(e.into());
            }
        };

        match assemble(&descriptor, &token) {
            Ok(client) => {
                debug!(?client, "client ready");
                Outcome::success(client)
            }
            Err(e) => {
                error!(error = %e, "assembling client failed");
                Outcome::from_error(e.into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::app::aws::MockCredentialSource;
    use crate::app::client::test::{test_ca_pem, test_credentials};
    use crate::app::eks::{ClusterMetadata, MockControlPlane};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn event(name: &str, region: &str, log_level: &str) -> InvocationEvent {
        InvocationEvent {
            kubernetes_name: name.to_string(),
            region: region.to_string(),
            log_level: log_level.to_string(),
        }
    }

    fn cluster(name: &str, ca_data: String) -> ClusterMetadata {
        ClusterMetadata {
            name: Some(name.to_string()),
            endpoint: Some("https://x.eks.amazonaws.com".to_string()),
            certificate_authority_data: Some(ca_data),
        }
    }

    #[test]
    fn event_uses_camel_case_fields() -> anyhow::Result<()> {
        let event: InvocationEvent =
            serde_json::from_str(r#"{"kubernetesName":"prod-cluster","logLevel":"debug"}"#)?;
        assert_eq!(event.kubernetes_name, "prod-cluster");
        assert_eq!(event.region, "");
        assert_eq!(event.log_level, "debug");
        Ok(())
    }

    #[test]
    fn request_defaults_region_and_level() -> anyhow::Result<()> {
        let request = InvocationRequest::try_from(&event("prod-cluster", "", ""))?;
        assert_eq!(request.region(), DEFAULT_REGION);
        assert_eq!(request.log_level(), LogLevel::Info);

        let request = InvocationRequest::try_from(&event("prod-cluster", "us-east-2", "chatty"))?;
        assert_eq!(request.region(), "us-east-2");
        assert_eq!(request.log_level(), LogLevel::Info);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn empty_name_is_benign_whatever_else_is_set() {
        for (region, level) in [("", ""), ("us-east-1", "debug"), ("eu-west-2", "nonsense")] {
            let mut control_plane = MockControlPlane::new();
            control_plane.expect_describe_cluster().never();
            let mut credentials = MockCredentialSource::new();
            credentials.expect_credentials().never();

            let outcome = Handshake::new(&control_plane, &credentials)
                .handle_event(&event("", region, level))
                .await;

            let (status, error) = outcome.into_parts();
            assert_eq!(status.as_str(), "empty Kubernetes Name");
            assert!(error.is_none());
        }
    }

    #[tokio::test]
    async fn handle_reports_empty_name_with_its_own_logger() {
        let mut control_plane = MockControlPlane::new();
        control_plane.expect_describe_cluster().never();
        let mut credentials = MockCredentialSource::new();
        credentials.expect_credentials().never();

        let outcome = Handshake::new(&control_plane, &credentials)
            .handle(&event("", "", "warn"))
            .await;

        assert_eq!(outcome.status, Status::EmptyKubernetesName);
    }

    #[test_log::test(tokio::test)]
    async fn prod_cluster_with_default_region_succeeds() {
        let ca_data = STANDARD.encode(test_ca_pem());
        let mut control_plane = MockControlPlane::new();
        control_plane
            .expect_describe_cluster()
            .withf(|region, name| region == DEFAULT_REGION && name == "prod-cluster")
            .times(1)
            .returning(move |_, name| Ok(cluster(name, ca_data.clone())));
        let credentials = test_credentials();

        let outcome = Handshake::new(&control_plane, &credentials)
            .handle_event(&event("prod-cluster", "", "debug"))
            .await;

        assert_eq!(outcome.status.as_str(), "Success");
        assert!(outcome.error.is_none());
        let client = outcome.client.expect("client handle");
        assert_eq!(client.cluster_identifier(), "prod-cluster");
        assert_eq!(client.endpoint().host(), Some("x.eks.amazonaws.com"));
    }

    #[test_log::test(tokio::test)]
    async fn missing_cluster_stops_before_signing() {
        let mut control_plane = MockControlPlane::new();
        control_plane.expect_describe_cluster().times(1).returning(|region, name| {
            Err(ResolveError::ClusterNotFound {
                name: name.to_string(),
                region: region.to_string(),
            })
        });
        let mut credentials = MockCredentialSource::new();
        credentials.expect_credentials().never();

        let outcome = Handshake::new(&control_plane, &credentials)
            .handle_event(&event("ghost-cluster", "eu-west-1", "info"))
            .await;

        let (status, error) = outcome.into_parts();
        assert_eq!(status.as_str(), "Error Describing Clusters");
        let error = error.expect("describe error");
        assert_eq!(error.kind(), ErrorKind::Upstream);
    }

    #[tokio::test]
    async fn malformed_ca_is_a_configuration_error_without_signing() {
        let mut control_plane = MockControlPlane::new();
        control_plane
            .expect_describe_cluster()
            .returning(|_, name| Ok(cluster(name, "%%%".to_string())));
        let mut credentials = MockCredentialSource::new();
        credentials.expect_credentials().never();

        let outcome = Handshake::new(&control_plane, &credentials)
            .handle_event(&event("prod-cluster", "eu-west-1", ""))
            .await;

        assert_eq!(outcome.status.as_str(), "Error creating clientset");
        assert!(outcome.client.is_none());
        let error = outcome.error.expect("configuration error");
        assert_eq!(error.kind(), ErrorKind::Configuration);
        assert!(matches!(
            error,
            HandshakeError::Resolve(ResolveError::MalformedCertificate { .. })
        ));
    }

    #[tokio::test]
    async fn credential_failure_is_reported_as_clientset_error() {
        let ca_data = STANDARD.encode(test_ca_pem());
        let mut control_plane = MockControlPlane::new();
        control_plane
            .expect_describe_cluster()
            .returning(move |_, name| Ok(cluster(name, ca_data.clone())));
        let mut credentials = MockCredentialSource::new();
        credentials.expect_credentials().times(1).returning(|| {
            Err(SignError::CredentialUnavailable {
                source: aws_credential_types::provider::error::CredentialsError::not_loaded(
                    "no credentials in test",
                ),
            })
        });

        let outcome = Handshake::new(&control_plane, &credentials)
            .handle_event(&event("prod-cluster", "eu-west-1", ""))
            .await;

        assert_eq!(outcome.status, Status::ErrorCreatingClientset);
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::Upstream));
    }

    #[tokio::test]
    async fn cluster_reporting_another_name_is_still_consistent() {
        // The token is signed for whatever name the control plane reports, so
        // descriptor and token always agree.
        let ca_data = STANDARD.encode(test_ca_pem());
        let mut control_plane = MockControlPlane::new();
        control_plane
            .expect_describe_cluster()
            .returning(move |_, _| Ok(cluster("prod-cluster-canonical", ca_data.clone())));
        let credentials = test_credentials();

        let outcome = Handshake::new(&control_plane, &credentials)
            .handle_event(&event("prod-cluster", "eu-west-1", ""))
            .await;

        let client = outcome.client.expect("client handle");
        assert_eq!(client.cluster_identifier(), "prod-cluster-canonical");
    }

    #[tokio::test]
    async fn each_invocation_signs_a_fresh_token() {
        let ca_data = STANDARD.encode(test_ca_pem());
        let mut control_plane = MockControlPlane::new();
        control_plane
            .expect_describe_cluster()
            .times(2)
            .returning(move |_, name| Ok(cluster(name, ca_data.clone())));
        let credentials = test_credentials();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ticks = Arc::new(AtomicI64::new(0));
        let clock: Clock = Arc::new(move || {
            start + chrono::Duration::seconds(ticks.fetch_add(1, Ordering::SeqCst))
        });
        let handshake = Handshake::new(&control_plane, &credentials).with_clock(clock);
        let request = InvocationRequest::new("prod-cluster", None, None).expect("request");

        let first = handshake.run(&request).await.client.expect("first client");
        let second = handshake.run(&request).await.client.expect("second client");

        assert_eq!(first.token().signed_at(), start);
        assert_eq!(second.token().signed_at(), start + chrono::Duration::seconds(1));
        assert_ne!(
            first.token().value().expose(),
            second.token().value().expose()
        );
    }

    #[test]
    fn region_is_trimmed_before_use() -> anyhow::Result<()> {
        let request = InvocationRequest::try_from(&event("prod-cluster", " us-east-1 ", ""))?;
        assert_eq!(request.region(), "us-east-1");

        let request = InvocationRequest::try_from(&event("prod-cluster", "   ", ""))?;
        assert_eq!(request.region(), DEFAULT_REGION);
        Ok(())
    }

    #[tokio::test]
    async fn incomplete_description_is_reported_as_clientset_error() {
        let mut control_plane = MockControlPlane::new();
        control_plane.expect_describe_cluster().returning(|_, name| {
            Ok(ClusterMetadata {
                certificate_authority_data: None,
                ..cluster(name, String::new())
            })
        });
        let mut credentials = MockCredentialSource::new();
        credentials.expect_credentials().never();

        let outcome = Handshake::new(&control_plane, &credentials)
            .handle_event(&event("prod-cluster", "eu-west-1", ""))
            .await;

        assert_eq!(outcome.status, Status::ErrorCreatingClientset);
        assert_eq!(
            outcome.error.map(|e| e.kind()),
            Some(ErrorKind::Configuration)
        );
    }

    #[test]
    fn status_serializes_to_its_phrase() -> anyhow::Result<()> {
        assert_eq!(
            serde_json::to_string(&Status::ErrorCreatingClientset)?,
            r#""Error creating clientset""#
        );
        assert_eq!(Status::EmptyKubernetesName.to_string(), "empty Kubernetes Name");
        Ok(())
    }
}
