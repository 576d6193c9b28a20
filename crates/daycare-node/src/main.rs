use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use base64::Engine;
use clap::Parser;
use daycare_node::docker::DockerCli;
use daycare_node::{router, DaycareState, Heartbeat};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "daycare-node")]
#[command(about = "Runs signed grading actions in resource-limited containers")]
struct Args {
    /// Listen address for HTTP and WebSocket traffic.
    #[arg(long, env = "DAYCARE_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,
    /// Canonical hostname; bundles signed for any other host are refused.
    #[arg(long, env = "DAYCARE_HOSTNAME")]
    hostname: String,
    /// Base URL of the authority, used for registration and CORS.
    #[arg(long, env = "DAYCARE_AUTHORITY_URL")]
    authority_url: String,
    /// Shared HMAC secret. Prefix with `base64:` to pass encoded bytes.
    #[arg(long, env = "DAYCARE_SECRET", hide_env_values = true)]
    secret: String,
    /// Number of sandboxes allowed to run at once.
    #[arg(long, env = "DAYCARE_CAPACITY", default_value_t = 1)]
    capacity: u32,
    /// Problem types this host can run.
    #[arg(long, env = "DAYCARE_PROBLEM_TYPES", value_delimiter = ',')]
    problem_types: Vec<String>,
    /// Path to the docker binary.
    #[arg(long, env = "DAYCARE_DOCKER", default_value = "docker")]
    docker: String,
    /// Seconds between registrations with the authority.
    #[arg(long, env = "DAYCARE_HEARTBEAT_SECS", default_value_t = 10)]
    heartbeat_secs: u64,
}

fn decode_secret(raw: &str) -> anyhow::Result<Vec<u8>> {
    let secret = match raw.strip_prefix("base64:") {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("DAYCARE_SECRET is not valid base64")?,
        None => raw.as_bytes().to_vec(),
    };
    if secret.is_empty() {
        bail!("daycare secret is required (set DAYCARE_SECRET)");
    }
    Ok(secret)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();
    let secret = decode_secret(&args.secret)?;
    if args.capacity == 0 {
        bail!("capacity must be at least 1");
    }
    let problem_types: Vec<String> = args
        .problem_types
        .iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    if problem_types.is_empty() {
        bail!("at least one problem type is required (set DAYCARE_PROBLEM_TYPES)");
    }

    let state = DaycareState::new(
        secret,
        args.hostname.clone(),
        args.authority_url.clone(),
        args.capacity as usize,
        Arc::new(DockerCli::new(&args.docker)),
    );

    Heartbeat::new(
        &args.authority_url,
        args.hostname.clone(),
        problem_types.clone(),
        args.capacity,
        state.secret.clone(),
        Duration::from_secs(args.heartbeat_secs),
    )?
    .spawn();

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(
        "daycare-node {} listening on {} for {}",
        args.hostname,
        args.listen,
        problem_types.join(",")
    );
    axum::serve(listener, router(state)).await?;

    Ok(())
}
