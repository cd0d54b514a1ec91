use crate::app::aws::AmbientCredentials;
use crate::app::cli::{CliArgs, Command, HandshakeArgs, TokenArgs};
use crate::app::eks::EksControlPlane;
use crate::app::handler::{Handshake, InvocationEvent, Outcome, Status};
use crate::app::logging::{invocation_dispatch, LogLevel};
use crate::app::token::TokenSigner;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument::WithSubscriber;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
struct Report<'a> {
    status: Status,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_version: Option<&'a str>,
}

/// Parse the command line, run the requested command and return the process exit code.
pub async fn run() -> Result<i32> {
    let args = CliArgs::parse();
    match args.command {
        Some(Command::Token(token_args)) => {
            print_token(&token_args).await?;
            Ok(0)
        }
        Some(Command::Handshake(handshake_args)) => handshake(&handshake_args).await,
        None => handshake(&args.handshake).await,
    }
}

async fn handshake(args: &HandshakeArgs) -> Result<i32> {
    let event = match &args.event {
        Some(path) => read_event(path).await?,
        None => args.to_event(),
    };
    let level = event.log_level.parse::<LogLevel>().unwrap_or_default();

    let region = region_or_default(&event);
    let credentials = AmbientCredentials::load(region, args.profile.as_deref()).await;
    let control_plane = EksControlPlane::new(args.profile.clone());
    let handshake = Handshake::new(&control_plane, &credentials);

    async {
        let outcome = handshake.handle_event(&event).await;
        let server_version = if args.probe {
            probe(&outcome).await
        } else {
            None
        };
        report(outcome, server_version.as_deref()).await
    }
    .with_subscriber(invocation_dispatch(level))
    .await
}

async fn probe(outcome: &Outcome) -> Option<String> {
    let client = outcome.client.as_ref()?;
    match client.server_version().await {
        Ok(info) => {
            info!(
                git_version = %info.git_version,
                platform = %info.platform,
                "API server answered"
            );
            Some(info.git_version)
        }
        Err(e) => {
            warn!(error = %e, "API server version probe failed");
            None
        }
    }
}

async fn report(outcome: Outcome, server_version: Option<&str>) -> Result<i32> {
    let exit_code = if outcome.is_success() || outcome.status == Status::EmptyKubernetesName {
        0
    } else {
        1
    };
    let (status, error) = outcome.into_parts();
    let report = Report {
        status,
        error: error.map(|e| e.to_string()),
        server_version,
    };

    let mut body = serde_json::to_vec(&report)?;
    body.push(b'\n');
    tokio::io::stdout().write_all(&body).await?;
    tokio::io::stdout().flush().await?;
    Ok(exit_code)
}

async fn print_token(args: &TokenArgs) -> Result<()> {
    let credentials = AmbientCredentials::load(&args.region, args.profile.as_deref()).await;
    let token = TokenSigner::new(&credentials, args.region.as_str())
        .sign(&args.cluster_name)
        .await?;
    let creds = serde_json::to_string(&token.to_exec_credential())?;
    tokio::io::stdout().write_all(creds.as_bytes()).await?;
    tokio::io::stdout().flush().await?;
    Ok(())
}

async fn read_event(path: &Path) -> Result<InvocationEvent> {
    let raw = if path == Path::new("-") {
        let mut raw = String::new();
        tokio::io::stdin().read_to_string(&mut raw).await?;
        raw
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading event from {}", path.display()))?
    };
    serde_json::from_str(&raw).context("parsing invocation event")
}

fn region_or_default(event: &InvocationEvent) -> &str {
    match event.region.trim() {
        "" => crate::app::DEFAULT_REGION,
        region => region,
    }
}
