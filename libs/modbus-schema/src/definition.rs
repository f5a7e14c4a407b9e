//! Serializable schema definition, as found in schema YAML files
//!
//! These are plain data; validation happens when a [`crate::Device`] is built.

use crate::address::MODBUS_MAX_REGISTERS_PER_REQUEST;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Highest schema feature level this runtime understands
pub const CURRENT_SCHEMA_FEATURE_LEVEL: u32 = 2;

fn default_feature_level() -> u32 {
    CURRENT_SCHEMA_FEATURE_LEVEL
}

fn default_max_registers() -> i64 {
    MODBUS_MAX_REGISTERS_PER_REQUEST as i64
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_feature_level")]
    pub schema_feature_level: u32,
    #[serde(default = "default_max_registers")]
    pub max_registers_per_modbus_request: i64,
    #[serde(default)]
    pub blocks: Vec<BlockDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Never changes once read, like a serial number or a scaling factor
    #[serde(default, skip_serializing_if = "is_false")]
    pub immutable: bool,
    /// Not meant for end users, like a scaling factor
    #[serde(default, skip_serializing_if = "is_false")]
    pub system: bool,
    pub expression: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input: Vec<TestRegisters>,
    pub blocks: Vec<TestBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRegisters {
    pub first_register_address: String,
    /// Register dump text
    pub registers: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBlock {
    pub id: String,
    /// Field id to the expected value(s); scalars are read as text
    #[serde(deserialize_with = "deserialize_expected")]
    pub expected: BTreeMap<String, Vec<String>>,
}

fn deserialize_expected<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(field, value)| {
            let items = match value {
                serde_yaml::Value::Sequence(items) => items,
                scalar => vec![scalar],
            };
            let values = items
                .into_iter()
                .map(|item| match item {
                    serde_yaml::Value::String(s) => Ok(s),
                    serde_yaml::Value::Number(n) => Ok(n.to_string()),
                    serde_yaml::Value::Bool(b) => Ok(b.to_string()),
                    other => Err(D::Error::custom(format!(
                        "Expected value for {} must be a scalar, got {:?}",
                        field, other
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok((field, values))
        })
        .collect()
}
