use std::path::Path;

use anyhow::{Context, Result};

use hybridjoin_engine::config::parser;
use hybridjoin_engine::config::validator;
use hybridjoin_engine::orchestrator;

/// Execute the `check` command: validate pipeline config and warehouse reachability.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    // 1. Parse pipeline YAML
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    // 2. Validate pipeline structure
    validator::validate_pipeline(&config)?;
    println!("Pipeline structure: OK");

    // 3. Probe warehouse, relations, dimensions and event file
    let result = orchestrator::check_pipeline(&config).await?;

    for item in &result.items {
        let status = if item.ok { "OK" } else { "FAILED" };
        println!("{:28} {}", format!("{}:", item.name), status);
        if !item.detail.is_empty() {
            println!("  {}", item.detail);
        }
    }

    let memory_bound = config.resources.memory_bound();
    println!("Memory bound:                {memory_bound} tuples");

    if result.all_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}
