//! Key exchange command handlers
//!
//! Keys are stored in the local cache only; no server connection is needed.

use std::path::Path;

use anyhow::{anyhow, Context, Result};

use campus_core::key_exchange::{render_svg, render_terminal};
use campus_core::{Config, KeyPayload, KeyRing, UserId};

use super::{open_cache, signed_in_user};
use crate::output::{Output, OutputFormat};

const SVG_SIZE: u32 = 320;

fn keyring(config: &Config) -> Result<KeyRing> {
    let user = signed_in_user(config)?;
    Ok(KeyRing::new(open_cache(config)?, &user))
}

/// Generate a key for the conversation with `peer` and show it
pub fn share(config: &Config, peer: &str, svg: Option<&Path>, output: &Output) -> Result<()> {
    let peer = UserId::new(peer).map_err(|e| anyhow!("Invalid user id '{}': {}", peer, e))?;
    let payload = keyring(config)?.share_with(&peer)?;

    if let Some(path) = svg {
        let image = render_svg(&payload, SVG_SIZE)?;
        std::fs::write(path, image)
            .with_context(|| format!("Failed to write QR code to {:?}", path))?;
    }

    match output.format {
        OutputFormat::Json => output.json(&serde_json::json!({
            "address": payload.address,
            "payload": payload.encode(),
        })),
        OutputFormat::Quiet => println!("{}", payload.encode()),
        OutputFormat::Human => {
            println!("{}", render_terminal(&payload)?);
            println!("Conversation: {}", payload.address);
            println!("Payload:      {}", payload.encode());
            println!();
            println!("Have {} scan this code, or run on their side:", peer);
            println!("  campus key import '{}'", payload.encode());
        }
    }
    Ok(())
}

/// Store a scanned key payload
pub fn import(config: &Config, payload: &str, output: &Output) -> Result<()> {
    let payload = KeyPayload::parse(payload).context("Not a campus key payload")?;
    keyring(config)?.accept(&payload)?;
    output.success(&format!("Stored key for conversation {}", payload.address));
    Ok(())
}

pub fn list(config: &Config, output: &Output) -> Result<()> {
    let addresses = keyring(config)?.addresses()?;

    match output.format {
        OutputFormat::Json => output.json(&addresses),
        _ => {
            if addresses.is_empty() && !output.is_quiet() {
                println!("No conversation keys stored.");
            }
            for address in &addresses {
                println!("{}", address);
            }
        }
    }
    Ok(())
}
