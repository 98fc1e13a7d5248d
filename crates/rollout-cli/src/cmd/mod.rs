pub mod config;
pub mod diff;
pub mod runs;
pub mod serve;

use anyhow::Context;
use rollout_core::config::RolloutConfig;
use std::path::Path;

/// Load the configuration file, falling back to defaults when it is absent.
pub(crate) fn load_config(path: &Path) -> anyhow::Result<RolloutConfig> {
    RolloutConfig::load_or_default(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}
