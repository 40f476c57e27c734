//! Address command handler

use anyhow::{anyhow, Result};

use campus_core::{conversation_address, UserId};

use crate::output::{Output, OutputFormat};

pub fn show(a: &str, b: &str, output: &Output) -> Result<()> {
    let a = UserId::new(a).map_err(|e| anyhow!("Invalid user id '{}': {}", a, e))?;
    let b = UserId::new(b).map_err(|e| anyhow!("Invalid user id '{}': {}", b, e))?;
    let address = conversation_address(&a, &b);

    match output.format {
        OutputFormat::Json => output.json(&serde_json::json!({ "address": address })),
        _ => println!("{}", address),
    }
    Ok(())
}
