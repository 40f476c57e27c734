//! Status command handler

use anyhow::Result;

use campus_core::Config;

use super::open_cache;
use crate::output::{Output, OutputFormat};

/// Show configuration and cache statistics
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let cache = open_cache(config)?;
    let stats = cache.stats()?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "user_id": config.user_id,
                    "remote_url": config.remote_url,
                    "cache": {
                        "path": config.cache_path(),
                        "total": stats.total,
                        "by_type": stats.by_type
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", stats.total);
        }
        OutputFormat::Human => {
            println!("Campus Status");
            println!("=============");
            println!();
            println!(
                "User:   {}",
                config.user_id.as_deref().unwrap_or("(not signed in)")
            );
            println!(
                "Server: {}",
                config.remote_url.as_deref().unwrap_or("(not configured)")
            );
            println!();
            println!("Cache:");
            println!("  Location: {}", config.cache_path().display());
            println!("  Records:  {}", stats.total);
            for (entity_type, count) in &stats.by_type {
                println!("    {:<18} {}", entity_type, count);
            }
        }
    }

    Ok(())
}
