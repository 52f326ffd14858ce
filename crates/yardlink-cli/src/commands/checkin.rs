//! `yardlink checkin`: run the check-in handshake once.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;
use tracing::info;

use yardlink_client::{AgentClient, AgentConfig, CheckinOutcome};

use super::Globals;

/// Options shared by `checkin` and `listen`.
#[derive(Args, Debug, Clone)]
pub struct CheckinArgs {
    /// Yard to check in to (default: checkin.yard_uid from the config)
    #[arg(long)]
    pub yard: Option<String>,

    /// Status to report (default: checkin.status from the config)
    #[arg(long)]
    pub status: Option<String>,

    /// Agent uuid (default: derived from the identity key)
    #[arg(long)]
    pub uuid: Option<String>,

    /// Existing broker account; skips anonymous bootstrap
    #[arg(long, requires = "password")]
    pub username: Option<String>,

    #[arg(long, requires = "username")]
    pub password: Option<String>,
}

/// Build the client, connect with an existing account if given, and check in.
pub async fn check_in(
    globals: &Globals,
    args: &CheckinArgs,
) -> Result<(AgentClient, AgentConfig, CheckinOutcome)> {
    let config = globals.load_config()?;
    let yard = args
        .yard
        .clone()
        .or_else(|| config.checkin.yard_uid.clone())
        .context("no yard given; pass --yard or set checkin.yard_uid")?;

    let client = globals.client(&config, args.uuid.as_deref())?;

    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        client
            .connect(username, password)
            .await
            .with_context(|| format!("failed to connect as '{username}'"))?;
    }

    let mut request = config.checkin_request(yard.clone());
    if let Some(status) = &args.status {
        request = request.status(status.clone());
    }

    let outcome = client
        .perform_checkin(request)
        .await
        .with_context(|| format!("check-in to yard '{yard}' failed"))?;
    info!(uuid = %outcome.uuid, username = %outcome.username, attempts = outcome.attempts, "checked in");
    Ok((client, config, outcome))
}

pub async fn run(globals: &Globals, args: &CheckinArgs) -> Result<()> {
    let (client, _, outcome) = check_in(globals, args).await?;

    println!("Checked in as {}", outcome.uuid);
    println!("  Broker account: {}", outcome.username);
    if let Some(yard_id) = outcome.checkin_data.get("yard_id") {
        println!("  Yard id:        {yard_id}");
    }
    println!("  Attempts:       {}", outcome.attempts);
    println!(
        "{}",
        serde_json::to_string_pretty(&Value::Object(outcome.checkin_data))?
    );

    client.close().await.context("failed to close connection")?;
    Ok(())
}
