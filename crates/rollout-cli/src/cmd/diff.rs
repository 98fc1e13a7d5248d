use crate::output::{print_json, print_table};
use anyhow::Context;
use rollout_clients::GraphqlStore;
use std::path::Path;

/// Print `branch − baseline` as the coordinator would compute it.
pub fn run(config_path: &Path, branch: &str, baseline: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let baseline = baseline.unwrap_or(&config.store.baseline_branch).to_string();
    let store = GraphqlStore::new(&config.store)?;

    let rt = tokio::runtime::Runtime::new()?;
    let entries = rt
        .block_on(rollout_core::diff::detect(&store, branch, &baseline))
        .with_context(|| format!("failed to diff '{branch}' against '{baseline}'"))?;

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No devices changed on '{branch}' relative to '{baseline}'.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| {
            vec![
                e.display_label.clone(),
                e.object_id.clone(),
                e.expected_checksum.clone(),
            ]
        })
        .collect();
    print_table(&["DEVICE", "OBJECT", "CHECKSUM"], &rows);
    Ok(())
}
