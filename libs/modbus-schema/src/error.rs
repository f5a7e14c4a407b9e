//! Error types for modbus-schema

use crate::address::Address;
use thiserror::Error;

pub use errors::{
    CommunicationError, CompileError, DecodeError, ProblemReport, ScenarioMismatch, SchemaError,
};

/// Errors in the textual register dump format (`0001 ---- xxxx ...`)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterTextError {
    #[error("Invalid register value \"{0}\" (expected up to 4 hex digits, ----, null or xxxx)")]
    InvalidWord(String),

    #[error("Register list starting at {start} with {count} registers exceeds the address space")]
    OutOfRange { start: Address, count: usize },
}

pub type Result<T> = std::result::Result<T, SchemaError>;
