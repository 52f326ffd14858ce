//! `yardlink listen`: check in and print inbound messages until Ctrl-C.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use yardlink_client::router::MessageContext;
use yardlink_client::MessageRouter;
use yardlink_core::codec::{EnvelopeCodec, SignaturePolicy};

use super::checkin::{check_in, CheckinArgs};
use super::Globals;

fn print_line(ctx: &MessageContext, kind: &str, payload: serde_json::Value) {
    let line = json!({
        "channel": ctx.channel,
        "sender": ctx.sender,
        "kind": kind,
        "message": payload,
    });
    println!("{line}");
}

fn printing_router(router: MessageRouter) -> MessageRouter {
    router
        .on_execution(|ctx, cmd| print_line(ctx, "assignment", json!(cmd)))
        .on_cancel(|ctx, cmd| print_line(ctx, "cancel", json!(cmd)))
        .on_reserve(|ctx, req| print_line(ctx, "reserve", json!(req)))
        .on_release(|ctx, req| print_line(ctx, "release", json!(req)))
        .on_other(|ctx, raw| {
            print_line(ctx, "other", json!(String::from_utf8_lossy(raw)))
        })
}

fn routers(codec: std::sync::Arc<EnvelopeCodec>, policy: SignaturePolicy) -> (MessageRouter, MessageRouter) {
    (
        printing_router(MessageRouter::assignments(codec.clone()).policy(policy)),
        printing_router(MessageRouter::instant_actions(codec).policy(policy)),
    )
}

pub async fn run(globals: &Globals, args: &CheckinArgs) -> Result<()> {
    let (client, config, outcome) = check_in(globals, args).await?;
    eprintln!("Checked in as {}; listening (Ctrl-C to stop)", outcome.uuid);

    let policy = if config.checkin.require_signed_response {
        SignaturePolicy::RequireSigned
    } else {
        SignaturePolicy::AllowUnsigned
    };
    let (assignments, instant_actions) = routers(client.codec(), policy);
    client
        .consume_assignments(assignments)
        .await
        .context("failed to subscribe to assignments")?;
    client
        .consume_instant_actions(instant_actions)
        .await
        .context("failed to subscribe to instant actions")?;

    tokio::select! {
        result = client.start_consuming() => {
            result.context("consume loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            client.stop_consuming();
        }
    }

    client.close().await.context("failed to close connection")?;
    Ok(())
}
