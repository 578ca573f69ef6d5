use std::path::Path;

use anyhow::{Context, Result};

use hybridjoin_engine::config::parser;
use hybridjoin_engine::config::validator;
use hybridjoin_engine::orchestrator;

/// Execute the `run` command: parse, validate, and run a pipeline.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    // 1. Parse pipeline YAML
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    // 2. Validate
    validator::validate_pipeline(&config)?;

    tracing::info!(
        pipeline = config.pipeline,
        warehouse = %config.warehouse.path.display(),
        source = %config.source.path.display(),
        "Pipeline validated"
    );

    // 3. Run
    let result = orchestrator::run_pipeline(&config).await?;

    println!("Pipeline '{}' completed successfully.", config.pipeline);
    println!("  Events streamed:  {}", result.source.streamed);
    for stage in &result.stages {
        println!("  Stage {} (key {}):", stage.stage, stage.join_key);
        println!("    Processed:     {}", stage.processed);
        println!(
            "    Joined:        {} ({:.2}%)",
            stage.joined,
            stage.join_rate()
        );
        println!("    Flushed:       {}", stage.flushed);
        println!(
            "    Disk probes:   {} ({} failed, {:.2} joins/probe)",
            stage.probes,
            stage.probe_failures,
            stage.joins_per_probe()
        );
        println!("    Peak window:   {}", stage.peak_window);
    }
    println!("  Facts loaded:     {}", result.records_loaded());
    println!("  Facts dropped:    {}", result.records_dropped());
    println!("  Efficiency:       {:.2}%", result.efficiency());
    println!("  Duration:         {:.2}s", result.duration_secs);
    println!("  Throughput:       {:.0} facts/sec", result.throughput());
    println!("  Memory bound:     {} tuples", result.memory_bound_tuples);

    // Machine-readable JSON for benchmarking tools
    let json = serde_json::json!({
        "pipeline": result.pipeline,
        "records_streamed": result.source.streamed,
        "records_joined": result.records_joined(),
        "records_loaded": result.records_loaded(),
        "records_dropped": result.records_dropped(),
        "duration_secs": result.duration_secs,
        "throughput": result.throughput(),
        "efficiency_pct": result.efficiency(),
        "memory_bound_tuples": result.memory_bound_tuples,
        "stages": result.stages,
    });
    println!("@@BENCH_JSON@@{json}");

    Ok(())
}
