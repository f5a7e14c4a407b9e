//! Schema YAML loading and export

use crate::definition::{BlockDefinition, FieldDefinition, SchemaDefinition};
use crate::device::Device;
use crate::error::{Result, SchemaError};
use std::path::Path;
use tracing::{debug, info, warn};

/// Parse and build a device without running its embedded tests
pub fn parse_str(yaml: &str) -> Result<Device> {
    let definition: SchemaDefinition = serde_yaml::from_str(yaml)?;
    Device::build(definition)
}

/// Parse, build and verify a schema
///
/// A schema whose tests do not all pass is rejected with the rendered report.
pub async fn load_str(yaml: &str) -> Result<Device> {
    let device = parse_str(yaml)?;
    let report = device.verify_provided_tests().await;
    if report.results.is_empty() {
        warn!("Schema \"{}\" has no tests", device.description());
    } else if !report.all_passed() {
        return Err(SchemaError::ScenarioFailed(report.render()));
    }
    info!(
        "Loaded schema \"{}\": {} blocks, {} fields, {} tests passed",
        device.description(),
        device.blocks().count(),
        device.compiled_fields().len(),
        report.results.len()
    );
    Ok(device)
}

pub async fn load_file(path: impl AsRef<Path>) -> Result<Device> {
    let path = path.as_ref();
    debug!("Reading schema from {}", path.display());
    let text = tokio::fs::read_to_string(path).await?;
    load_str(&text).await
}

/// The normalized definition of a device
pub fn to_definition(device: &Device) -> SchemaDefinition {
    SchemaDefinition {
        description: device.description().to_string(),
        schema_feature_level: device.schema_feature_level(),
        max_registers_per_modbus_request: i64::from(device.max_registers_per_request()),
        blocks: device
            .blocks()
            .map(|block| BlockDefinition {
                id: block.id().to_string(),
                description: block.description().map(str::to_string),
                fields: block
                    .fields()
                    .map(|field| FieldDefinition {
                        id: field.id().to_string(),
                        description: field.description().to_string(),
                        immutable: field.compiled().declared_immutable,
                        system: field.is_system(),
                        expression: field.expression().to_string(),
                        unit: field.unit().to_string(),
                    })
                    .collect(),
            })
            .collect(),
        tests: device.tests().iter().map(|t| t.to_definition()).collect(),
    }
}

/// Normalized schema YAML: canonical expressions and clean register dumps
pub fn to_yaml(device: &Device) -> Result<String> {
    Ok(serde_yaml::to_string(&to_definition(device))?)
}

pub async fn save_file(device: &Device, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::write(path, to_yaml(device)?).await?;
    info!("Wrote schema to {}", path.display());
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
description: 'Loader'
schemaFeatureLevel: 2
blocks:
  - id: Block
    description: 'The only block'
    fields:
      - id: Raw
        system: true
        expression: 'int16( hr:1 )'
      - id: Scaled
        unit: 'V'
        expression: 'Raw*10'
      - id: Serial
        immutable: true
        expression: 'hexstring(hr:2#2)'
tests:
  - id: Basic
    input:
      - firstRegisterAddress: 'hr:1'
        registers: '0005 CAFE 0001'
    blocks:
      - id: Block
        expected:
          Raw: 5
          Scaled: 50
          Serial: '0xCA 0xFE 0x00 0x01'
"#;

    #[tokio::test]
    async fn test_load_verifies_tests() {
        let device = load_str(SCHEMA).await.unwrap();
        assert_eq!(device.description(), "Loader");
        assert_eq!(device.tests().len(), 1);

        let broken = SCHEMA.replace("Scaled: 50", "Scaled: 51");
        match load_str(&broken).await {
            Err(SchemaError::ScenarioFailed(report)) => {
                assert!(report.contains("[FAIL] Schema test \"Basic\""));
                assert!(report.contains("51"));
            },
            other => panic!("Expected a scenario failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_yaml_errors_carry_location() {
        let err = parse_str("blocks:\n  - id: [unclosed\n").unwrap_err();
        match err {
            SchemaError::Yaml { location, .. } => assert!(location.starts_with("line")),
            other => panic!("Unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_rejects_future_feature_level() {
        let err = parse_str("schemaFeatureLevel: 3\nblocks: []\n").unwrap_err();
        assert!(matches!(
            err,
            SchemaError::UnsupportedFeatureLevel { found: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_export_is_normalized() {
        let device = load_str(SCHEMA).await.unwrap();
        let yaml = to_yaml(&device).unwrap();
        assert!(yaml.contains("int16(hr:00001)"));
        assert!(yaml.contains("hr:00001"));
        assert!(yaml.contains("0005 CAFE 0001"));
        assert!(yaml.contains("immutable: true"));
        assert!(yaml.contains("system: true"));

        // The export loads again and passes its own tests
        let again = load_str(&yaml).await.unwrap();
        assert_eq!(to_yaml(&again).unwrap(), yaml);
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.yaml");
        let device = load_str(SCHEMA).await.unwrap();
        save_file(&device, &path).await.unwrap();
        let loaded = load_file(&path).await.unwrap();
        assert_eq!(loaded.compiled_fields().len(), 3);

        let missing = load_file(dir.path().join("missing.yaml")).await;
        assert!(matches!(missing, Err(SchemaError::Io(_))));
    }
}
