use anyhow::{Result, bail};
use std::collections::HashSet;

use crate::config::{MAX_COOLDOWN_SECONDS, RelayConfig};

/// Validate a loaded relay configuration.
/// Returns Ok(()) if valid, or Err with a descriptive message.
pub fn validate_config(config: &RelayConfig) -> Result<()> {
    validate_queue(config)?;
    validate_retry(config)?;
    validate_credentials(config)?;
    validate_model(config)?;
    validate_compaction(config)?;
    Ok(())
}

fn validate_queue(config: &RelayConfig) -> Result<()> {
    if config.queue.max_concurrent == 0 {
        bail!("queue.max_concurrent must be > 0 (got 0)");
    }
    if config.queue.wait_timeout_seconds == 0 {
        bail!("queue.wait_timeout_seconds must be > 0 (got 0)");
    }
    Ok(())
}

fn validate_retry(config: &RelayConfig) -> Result<()> {
    if config.retry.backoff_max_ms < config.retry.backoff_initial_ms {
        bail!(
            "retry.backoff_max_ms ({}) must be >= retry.backoff_initial_ms ({})",
            config.retry.backoff_max_ms,
            config.retry.backoff_initial_ms
        );
    }
    Ok(())
}

fn validate_credentials(config: &RelayConfig) -> Result<()> {
    if config.credentials.cooldown_seconds > MAX_COOLDOWN_SECONDS {
        bail!(
            "credentials.cooldown_seconds must be <= {MAX_COOLDOWN_SECONDS} (got {})",
            config.credentials.cooldown_seconds
        );
    }
    let mut seen = HashSet::new();
    for profile in &config.credentials.profiles {
        if profile.id.trim().is_empty() {
            bail!("credentials.profiles: id cannot be empty");
        }
        if profile.family.trim().is_empty() {
            bail!("credentials.profiles '{}': family cannot be empty", profile.id);
        }
        if !seen.insert(profile.id.as_str()) {
            bail!("credentials.profiles: duplicate id '{}'", profile.id);
        }
    }
    if config.credentials.profiles.is_empty() {
        tracing::warn!("No credential profiles configured; every dispatch will fail");
    }
    Ok(())
}

fn validate_model(config: &RelayConfig) -> Result<()> {
    config.model.chain()?;
    Ok(())
}

fn validate_compaction(config: &RelayConfig) -> Result<()> {
    let compaction = &config.compaction;
    if compaction.token_budget == 0 {
        bail!("compaction.token_budget must be > 0 (got 0)");
    }
    if compaction.keep_last == 0 {
        bail!("compaction.keep_last must be >= 1 (the newest turn is always kept)");
    }
    let ratio = compaction.overflow_budget_ratio;
    if !(ratio > 0.0 && ratio <= 1.0) {
        bail!("compaction.overflow_budget_ratio must be in (0, 1] (got {ratio})");
    }
    Ok(())
}
