//! Semantic validation for parsed pipeline configuration values.

use anyhow::{bail, Result};
use hybridjoin_state::sqlite::validate_identifier;

use crate::config::types::{DimensionConfig, PipelineConfig, RelationConfig};

fn check_identifier(name: &str, context: &str, errors: &mut Vec<String>) {
    if validate_identifier(name).is_err() {
        errors.push(format!("{context}: invalid identifier '{name}'"));
    }
}

fn validate_relation(relation: &RelationConfig, context: &str, errors: &mut Vec<String>) {
    check_identifier(&relation.table, &format!("{context}.table"), errors);
    check_identifier(&relation.key, &format!("{context}.key"), errors);
    for column in &relation.columns {
        check_identifier(column, &format!("{context}.columns"), errors);
    }
}

fn validate_dimension(dimension: &DimensionConfig, context: &str, errors: &mut Vec<String>) {
    check_identifier(&dimension.table, &format!("{context}.table"), errors);
    check_identifier(&dimension.natural_key, &format!("{context}.natural_key"), errors);
    check_identifier(&dimension.surrogate_key, &format!("{context}.surrogate_key"), errors);
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.warehouse.path.as_os_str().is_empty() {
        errors.push("warehouse.path must not be empty".to_string());
    }

    if config.source.path.as_os_str().is_empty() {
        errors.push("source.path must not be empty".to_string());
    }

    validate_relation(&config.stages.customer, "stages.customer", &mut errors);
    validate_relation(&config.stages.product, "stages.product", &mut errors);
    if config.stages.customer.key == config.stages.product.key {
        errors.push(format!(
            "Join stages must use distinct keys, both use '{}'",
            config.stages.customer.key
        ));
    }

    let dims = &config.dimensions;
    validate_dimension(&dims.customer, "dimensions.customer", &mut errors);
    validate_dimension(&dims.product, "dimensions.product", &mut errors);
    validate_dimension(&dims.store, "dimensions.store", &mut errors);
    validate_dimension(&dims.supplier, "dimensions.supplier", &mut errors);
    if let Some(date) = &dims.date {
        validate_dimension(date, "dimensions.date", &mut errors);
    }

    let res = &config.resources;
    for (name, value) in [
        ("window_capacity", res.window_capacity),
        ("partition_size", res.partition_size),
        ("stream_buffer", res.stream_buffer),
        ("intermediate_queue", res.intermediate_queue),
        ("batch_size", res.batch_size),
    ] {
        if value == 0 {
            errors.push(format!("resources.{name} must be at least 1"));
        }
    }
    if res.report_interval_secs == 0 {
        errors.push("resources.report_interval_secs must be at least 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn valid_yaml() -> &'static str {
        r#"
version: "1.0"
pipeline: test_pipeline
warehouse:
  path: dw.sqlite
source:
  path: transactions.csv
stages:
  customer:
    table: Master_Customer
    key: Customer_ID
    columns: [Gender, Age]
  product:
    table: Master_Product
    key: Product_ID
    columns: [Price, StoreID, SupplierID]
"#
    }

    #[test]
    fn valid_pipeline_passes() {
        let config = parse_pipeline_str(valid_yaml()).unwrap();
        assert!(validate_pipeline(&config).is_ok());
    }

    #[test]
    fn wrong_version_fails() {
        let yaml = valid_yaml().replace("\"1.0\"", "\"2.0\"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Unsupported pipeline version"));
    }

    #[test]
    fn empty_pipeline_name_fails() {
        let yaml = valid_yaml().replace("test_pipeline", "\"\"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Pipeline name must not be empty"));
    }

    #[test]
    fn injected_identifier_fails() {
        let yaml = valid_yaml().replace("[Gender, Age]", "[Gender, \"Age; DROP TABLE x\"]");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("stages.customer.columns"), "got: {err}");
    }

    #[test]
    fn shared_join_key_fails() {
        let yaml = valid_yaml().replace("key: Product_ID", "key: Customer_ID");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("distinct keys"));
    }

    #[test]
    fn zero_capacities_are_all_reported() {
        let yaml = format!(
            "{}resources:\n  window_capacity: 0\n  batch_size: 0\n",
            valid_yaml()
        );
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("window_capacity"));
        assert!(err.contains("batch_size"));
        assert!(!err.contains("partition_size"));
    }
}
