//! Token Guard
//!
//! Verifies one bearer token from the command line or stdin against the
//! identity provider configured in the environment, and prints its claims
//! as JSON.
//!
//! Exit status: 0 when the token is accepted, 1 when it is rejected,
//! 2 on configuration or I/O errors.

use std::io::Read;
use std::process::ExitCode;
use token_guard::config::Config;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing; stdout is reserved for the claims
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "token_guard=info,tg=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    info!(
        issuer = %config.policy.expected_issuer(),
        audience = %config.policy.expected_audience(),
        jwks_url = %config.policy.jwks_endpoint(),
        jwks_requests_per_minute = config.jwks_requests_per_minute,
        "Configuration loaded successfully"
    );

    let token = read_token()?;
    let verifier = config.build_verifier()?;

    match verifier.verify(&token).await {
        Ok(claims) => {
            println!("{}", serde_json::to_string_pretty(&claims)?);
            Ok(true)
        }
        Err(e) => {
            warn!(error_type = e.kind(), "{}", e);
            Ok(false)
        }
    }
}

/// First argument, or all of stdin. An optional `Bearer ` prefix is dropped.
fn read_token() -> Result<String, Box<dyn std::error::Error>> {
    let raw = match std::env::args().nth(1) {
        Some(arg) if arg != "-" => arg,
        _ => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            input
        }
    };

    let trimmed = raw.trim();
    let token = trimmed.strip_prefix("Bearer ").unwrap_or(trimmed).trim();
    if token.is_empty() {
        return Err("no token given on the command line or stdin".into());
    }

    Ok(token.to_string())
}
