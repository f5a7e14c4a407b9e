//! verify, describe and export

use anyhow::{Context, Result};
use colored::*;
use modbus_schema::{loader, Device, ProblemReport};
use std::path::Path;
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::info;

/// Build a device without running its tests
pub async fn read_schema(path: &Path) -> Result<Device> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Unable to read {}", path.display()))?;
    loader::parse_str(&text).with_context(|| format!("Invalid schema {}", path.display()))
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        ""
    }
}

/// Returns whether every test passed
pub async fn verify_command(path: &Path) -> Result<bool> {
    let device = read_schema(path).await?;
    let report = device.verify_provided_tests().await;
    if report.results.is_empty() {
        println!("{} {} has no tests", "WARNING".yellow(), path.display());
        return Ok(false);
    }

    for line in report.render().lines() {
        if line.starts_with("[PASS]") {
            println!("{}", line.green());
        } else if line.starts_with("[FAIL]") {
            println!("{}", line.red());
        } else {
            println!("{}", line);
        }
    }

    let failed = report.failed_tests();
    if failed.is_empty() {
        println!(
            "\n{} {} tests passed",
            "OK".green(),
            report.results.len()
        );
        Ok(true)
    } else {
        println!(
            "\n{} {} of {} tests failed: {}",
            "FAIL".red(),
            failed.len(),
            report.results.len(),
            failed.join(", ")
        );
        Ok(false)
    }
}

pub fn field_table(device: &Device) -> String {
    let mut builder = Builder::default();
    builder.push_record([
        "Block",
        "Field",
        "Type",
        "Unit",
        "Immutable",
        "System",
        "Expression",
    ]);
    for field in device.fields() {
        builder.push_record([
            field.block_id().to_string(),
            field.id().to_string(),
            field.return_type().to_string(),
            field.unit().to_string(),
            yes_no(field.is_immutable()).to_string(),
            yes_no(field.is_system()).to_string(),
            field.expression().to_string(),
        ]);
    }
    let mut table = builder.build();
    table.with(Style::ascii());
    table.to_string()
}

pub fn print_problems(problems: &ProblemReport) {
    if problems.is_empty() {
        return;
    }
    println!("\n{} {}", "WARNING".yellow(), problems.message);
    for (field, messages) in &problems.field_errors {
        for message in messages {
            println!("  {} {}", field.bright_yellow(), message);
        }
    }
}

pub async fn describe_command(path: &Path) -> Result<()> {
    let device = read_schema(path).await?;
    println!("{} {}", "Schema:".bright_cyan(), device.description());
    println!(
        "{} {} blocks, {} fields, {} tests, at most {} registers per request",
        "Contents:".bright_cyan(),
        device.blocks().count(),
        device.compiled_fields().len(),
        device.tests().len(),
        device.max_registers_per_request()
    );
    println!("{}", field_table(&device));
    print_problems(&device.initialization_problems());
    Ok(())
}

pub async fn export_command(path: &Path, output: Option<&Path>) -> Result<()> {
    let device = loader::load_file(path)
        .await
        .with_context(|| format!("Unable to load {}", path.display()))?;
    let yaml = loader::to_yaml(&device)?;
    match output {
        Some(output) => {
            tokio::fs::write(output, yaml)
                .await
                .with_context(|| format!("Unable to write {}", output.display()))?;
            info!("Exported {} to {}", path.display(), output.display());
        },
        None => print!("{}", yaml),
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
description: 'CLI'
blocks:
  - id: Main
    fields:
      - id: Count
        unit: 'pcs'
        immutable: true
        expression: 'uint16(hr:0)'
      - id: Double
        expression: 'Count * 2'
tests:
  - id: Basic
    input:
      - firstRegisterAddress: 'hr:0'
        registers: '0015'
    blocks:
      - id: Main
        expected:
          Count: 21
          Double: 42
"#;

    #[tokio::test]
    async fn test_verify_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.yaml");
        std::fs::write(&path, SCHEMA).unwrap();
        assert!(verify_command(&path).await.unwrap());

        let broken = dir.path().join("broken.yaml");
        std::fs::write(&broken, SCHEMA.replace("Double: 42", "Double: 43")).unwrap();
        assert!(!verify_command(&broken).await.unwrap());

        let output = dir.path().join("out.yaml");
        export_command(&path, Some(&output)).await.unwrap();
        let exported = std::fs::read_to_string(&output).unwrap();
        assert!(exported.contains("uint16(hr:00000)"));
        assert!(export_command(&broken, Some(&output)).await.is_err());
    }

    #[test]
    fn test_field_table() {
        let device = loader::parse_str(SCHEMA).unwrap();
        let table = field_table(&device);
        assert!(table.contains("Expression"));
        assert!(table.contains("pcs"));
        assert!(table.contains("LONG"));
        // Double depends only on an immutable field
        assert_eq!(table.matches("yes").count(), 2);
    }
}
