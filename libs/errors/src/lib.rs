//! Error taxonomy for the Modbus schema runtime
//!
//! Structural errors ([`SchemaError`], [`CompileError`]) abort loading a schema.
//! Per-cycle errors ([`DecodeError`], [`CommunicationError`]) only affect the
//! fields or requests they belong to. [`ScenarioMismatch`] is a record, never thrown.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// ============================================================================
// ProblemReport - aggregated non-fatal problems
// ============================================================================

/// Collection of named problems, keyed by the item they concern
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    /// Summary message
    pub message: String,
    /// Detailed description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Problems per item (e.g. `Block.Field`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_errors: BTreeMap<String, Vec<String>>,
}

impl ProblemReport {
    /// Create a new report with just a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            field_errors: BTreeMap::new(),
        }
    }

    /// Add details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Add a problem for an item
    pub fn add_field_error(mut self, field: impl Into<String>, error: impl Into<String>) -> Self {
        self.push(field, error);
        self
    }

    /// Add a problem for an item in place
    pub fn push(&mut self, field: impl Into<String>, error: impl Into<String>) {
        self.field_errors
            .entry(field.into())
            .or_default()
            .push(error.into());
    }

    pub fn is_empty(&self) -> bool {
        self.field_errors.is_empty()
    }

    /// Total number of problems over all items
    pub fn len(&self) -> usize {
        self.field_errors.values().map(Vec::len).sum()
    }
}

// ============================================================================
// SchemaError - load-time errors
// ============================================================================

/// Errors that abort building a device from a schema
#[derive(Debug, Error)]
pub enum SchemaError {
    // ======================================
    // Structure
    // ======================================
    #[error("Duplicate block id: {0}")]
    DuplicateBlock(String),

    #[error("Duplicate field id {field} in block {block}")]
    DuplicateField { block: String, field: String },

    #[error("Invalid identifier: \"{0}\"")]
    InvalidIdentifier(String),

    #[error("Cyclic dependency between fields: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    // ======================================
    // Expressions
    // ======================================
    #[error("In block {block} the field {field} has an invalid expression \"{expression}\": {source}")]
    Compile {
        block: String,
        field: String,
        expression: String,
        #[source]
        source: CompileError,
    },

    #[error("In block {block} the field {field} requires a block of {count} registers which cannot be retrieved over Modbus.")]
    FieldTooLarge {
        block: String,
        field: String,
        count: usize,
    },

    #[error("In block {block} the field {field} uses registers from multiple address classes: {classes}")]
    MixedAddressClasses {
        block: String,
        field: String,
        classes: String,
    },

    // ======================================
    // Configuration
    // ======================================
    #[error("The maxRegistersPerModbusRequest must be between 1 and 125 (was set to {0}).")]
    InvalidMaxRegisters(i64),

    #[error("Schema feature level {found} is newer than the supported level {supported}")]
    UnsupportedFeatureLevel { found: u32, supported: u32 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    // ======================================
    // Schema text and tests
    // ======================================
    #[error("YAML error at {location}: {message}")]
    Yaml { location: String, message: String },

    #[error("Invalid test {test}: {message}")]
    InvalidTest { test: String, message: String },

    #[error("Schema tests failed:\n{0}")]
    ScenarioFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchemaError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_test(test: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidTest {
            test: test.into(),
            message: msg.into(),
        }
    }

    /// Wrap a compile error with the location of the failing field
    pub fn compile(
        block: impl Into<String>,
        field: impl Into<String>,
        expression: impl Into<String>,
        source: CompileError,
    ) -> Self {
        Self::Compile {
            block: block.into(),
            field: field.into(),
            expression: expression.into(),
            source,
        }
    }

    /// Short stable code for display and scripting
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateBlock(_) => "DUPLICATE_BLOCK",
            Self::DuplicateField { .. } => "DUPLICATE_FIELD",
            Self::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            Self::CyclicDependency(_) => "CYCLIC_DEPENDENCY",
            Self::Compile { .. } => "COMPILE_ERROR",
            Self::FieldTooLarge { .. } => "FIELD_TOO_LARGE",
            Self::MixedAddressClasses { .. } => "MIXED_ADDRESS_CLASSES",
            Self::InvalidMaxRegisters(_) => "INVALID_MAX_REGISTERS",
            Self::UnsupportedFeatureLevel { .. } => "UNSUPPORTED_FEATURE_LEVEL",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Yaml { .. } => "YAML_ERROR",
            Self::InvalidTest { .. } => "INVALID_TEST",
            Self::ScenarioFailed(_) => "SCENARIO_FAILED",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

impl From<serde_yaml::Error> for SchemaError {
    fn from(err: serde_yaml::Error) -> Self {
        let location = err
            .location()
            .map(|l| format!("line {} column {}", l.line(), l.column()))
            .unwrap_or_else(|| "unknown position".to_string());
        Self::Yaml {
            location,
            message: err.to_string(),
        }
    }
}

// ============================================================================
// CompileError - expression compilation
// ============================================================================

/// Errors while compiling a field expression
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Register count error: {0}")]
    RegisterCount(String),

    #[error("Not implemented value error: {0}")]
    NotImplemented(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Invalid expression: {0}")]
    Invalid(String),
}

impl CompileError {
    pub fn syntax(position: usize, msg: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: msg.into(),
        }
    }

    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    pub fn register_count(msg: impl Into<String>) -> Self {
        Self::RegisterCount(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

// ============================================================================
// DecodeError - per field, per update cycle
// ============================================================================

/// Errors while decoding raw registers into a value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("No value for register {0}")]
    MissingRegister(String),

    #[error("Read error on register {0}")]
    ReadError(String),

    #[error("Required field {0} has no usable value")]
    MissingDependency(String),

    #[error("Insufficient registers: expected {expected}, got {actual}")]
    InsufficientRegisters { expected: usize, actual: usize },

    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("Value out of domain: {0}")]
    OutOfDomain(String),
}

impl DecodeError {
    pub fn missing_register(address: impl Into<String>) -> Self {
        Self::MissingRegister(address.into())
    }

    pub fn read_error(address: impl Into<String>) -> Self {
        Self::ReadError(address.into())
    }

    pub fn missing_dependency(field: impl Into<String>) -> Self {
        Self::MissingDependency(field.into())
    }

    pub fn insufficient(expected: usize, actual: usize) -> Self {
        Self::InsufficientRegisters { expected, actual }
    }

    pub fn out_of_domain(msg: impl Into<String>) -> Self {
        Self::OutOfDomain(msg.into())
    }
}

// ============================================================================
// CommunicationError - transport failures
// ============================================================================

/// Errors reported by a register transport for a single request
#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout after {0} ms")]
    Timeout(u64),

    #[error("Illegal data address: {0}")]
    IllegalDataAddress(String),

    #[error("Device exception {code}: {message}")]
    Exception { code: u8, message: String },

    #[error("Disconnected: {0}")]
    Disconnected(String),
}

impl CommunicationError {
    pub fn illegal_address(msg: impl Into<String>) -> Self {
        Self::IllegalDataAddress(msg.into())
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Whether the failure is tied to the requested addresses rather than the link
    pub fn is_address_related(&self) -> bool {
        matches!(
            self,
            Self::IllegalDataAddress(_) | Self::Exception { code: 2, .. }
        )
    }
}

// ============================================================================
// ScenarioMismatch - recorded scenario failure
// ============================================================================

/// One expected-versus-actual difference found while verifying a scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioMismatch {
    pub test: String,
    pub block: String,
    pub field: String,
    pub unit: String,
    pub expected: Vec<String>,
    pub actual: Vec<String>,
    /// Set when the mismatch is structural (unknown block or field)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_problem_report_builder() {
        let report = ProblemReport::new("Initialization problems")
            .with_details("2 fields")
            .add_field_error("Main.Name", "first")
            .add_field_error("Main.Name", "second")
            .add_field_error("Main.Other", "third");

        assert_eq!(report.len(), 3);
        assert!(!report.is_empty());
        assert_eq!(report.field_errors["Main.Name"].len(), 2);
        assert_eq!(report.details.as_deref(), Some("2 fields"));
    }

    #[test]
    fn test_schema_error_messages() {
        let err = SchemaError::FieldTooLarge {
            block: "Block".to_string(),
            field: "Name".to_string(),
            count: 130,
        };
        assert_eq!(
            err.to_string(),
            "In block Block the field Name requires a block of 130 registers which cannot be retrieved over Modbus."
        );
        assert_eq!(err.error_code(), "FIELD_TOO_LARGE");

        let err = SchemaError::InvalidMaxRegisters(0);
        assert_eq!(
            err.to_string(),
            "The maxRegistersPerModbusRequest must be between 1 and 125 (was set to 0)."
        );

        let err = SchemaError::CyclicDependency(vec!["A.x".to_string(), "A.y".to_string()]);
        assert_eq!(err.to_string(), "Cyclic dependency between fields: A.x -> A.y");
    }

    #[test]
    fn test_compile_error_is_source() {
        use std::error::Error as _;

        let err = SchemaError::compile(
            "Block",
            "Field",
            "int16(xx:1)",
            CompileError::invalid_address("xx:1"),
        );
        assert!(err.to_string().contains("In block Block the field Field"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_communication_error_classification() {
        assert!(CommunicationError::illegal_address("hr:00010").is_address_related());
        assert!(CommunicationError::Exception {
            code: 2,
            message: "Illegal data address".to_string()
        }
        .is_address_related());
        assert!(!CommunicationError::Timeout(500).is_address_related());
        assert!(!CommunicationError::disconnected("closed").is_address_related());
    }

    #[test]
    fn test_yaml_error_has_location() {
        let err: serde_yaml::Error =
            serde_yaml::from_str::<BTreeMap<String, String>>("a: [").unwrap_err();
        let err = SchemaError::from(err);
        match err {
            SchemaError::Yaml { location, .. } => assert!(location.starts_with("line")),
            other => panic!("Unexpected error {other:?}"),
        }
    }
}
