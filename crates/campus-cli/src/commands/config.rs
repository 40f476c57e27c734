//! Config command handlers

use anyhow::{bail, Context, Result};

use campus_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "remote_url": config.remote_url,
                    "user_id": config.user_id,
                    "listener_grace_ms": config.listener_grace_ms,
                    "log_level": config.log_level,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:          {}", config.data_dir.display());
            println!(
                "  remote_url:        {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  user_id:           {}",
                config.user_id.as_deref().unwrap_or("(not set)")
            );
            println!("  listener_grace_ms: {}", config.listener_grace_ms);
            println!("  log_level:         {}", config.log_level);
            println!(
                "  log_file:          {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    apply(&mut config, &key, &value)?;
    config.save().context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));
    Ok(())
}

/// Apply one `key = value` edit; "" and "none" clear optional keys
fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let optional = |value: &str| {
        if value.is_empty() || value == "none" {
            None
        } else {
            Some(value.to_string())
        }
    };

    match key {
        "data_dir" => config.data_dir = value.into(),
        "remote_url" => config.remote_url = optional(value),
        "user_id" => config.user_id = optional(value),
        "listener_grace_ms" => {
            config.listener_grace_ms = value
                .parse()
                .context("Invalid value for listener_grace_ms. Use a number of milliseconds.")?;
        }
        "log_level" => config.log_level = value.to_string(),
        "log_file" => config.log_file = optional(value).map(Into::into),
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, remote_url, user_id, listener_grace_ms, log_level, log_file",
                key
            );
        }
    }
    Ok(())
}
