use crate::app::handler::InvocationEvent;
use crate::app::logging::LogLevel;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    #[clap(subcommand)]
    pub command: Option<Command>,

    #[clap(flatten)]
    pub handshake: HandshakeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve the cluster, sign a token and build a client (the default)
    Handshake(HandshakeArgs),

    /// Print an ExecCredential document for kubectl's exec credential plugin
    Token(TokenArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct HandshakeArgs {
    /// Name of the EKS Kubernetes cluster
    #[clap(short = 'n', long, env = "EKS_CLUSTER_NAME")]
    pub kubernetes_name: Option<String>,

    /// Name of the AWS region that the cluster is in
    #[clap(short, long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Log verbosity
    #[clap(short, long, env = "LOG_LEVEL", value_enum)]
    pub log_level: Option<LogLevel>,

    /// AWS profile to use for authentication
    #[clap(short, long, env = "AWS_PROFILE")]
    pub profile: Option<String>,

    /// Read the invocation event as JSON from this file ("-" for stdin)
    #[clap(short, long, conflicts_with_all = ["kubernetes_name", "region", "log_level"])]
    pub event: Option<PathBuf>,

    /// Call the API server's /version endpoint once the client is built
    #[clap(long)]
    pub probe: bool,
}

impl HandshakeArgs {
    /// The event described by the flags alone; `--event` is read by the caller.
    pub fn to_event(&self) -> InvocationEvent {
        InvocationEvent {
            kubernetes_name: self.kubernetes_name.clone().unwrap_or_default(),
            region: self.region.clone().unwrap_or_default(),
            log_level: self.log_level.map(|level| level.to_string()).unwrap_or_default(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct TokenArgs {
    /// Name of the EKS Kubernetes cluster to get a token for
    #[clap(short, long, env = "EKS_CLUSTER_NAME")]
    pub cluster_name: String,

    /// Name of the AWS region that the cluster is in
    #[clap(short, long, env = "AWS_REGION", default_value = crate::app::DEFAULT_REGION)]
    pub region: String,

    /// AWS profile to use for authentication
    #[clap(short, long, env = "AWS_PROFILE")]
    pub profile: Option<String>,
}
