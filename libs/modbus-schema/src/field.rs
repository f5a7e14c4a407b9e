//! Compiled fields and their runtime state

use crate::address::{Address, AddressClass};
use crate::evaluator::FieldValues;
use crate::expression::Expression;
use crate::register::RegisterStore;
use crate::value::{ReturnType, Value};
use std::fmt;

/// A field after its expression has been compiled and bound
#[derive(Debug, Clone)]
pub struct CompiledField {
    /// Index of the owning block
    pub block: usize,
    pub block_id: String,
    pub id: String,
    pub description: String,
    pub unit: String,
    pub system: bool,
    /// As written in the schema
    pub declared_immutable: bool,
    /// Declared immutable, or derived only from immutable inputs
    pub immutable: bool,
    pub expression: Expression,
}

impl CompiledField {
    pub fn return_type(&self) -> ReturnType {
        self.expression.return_type()
    }

    pub fn required_registers(&self) -> &[Address] {
        self.expression.required_registers()
    }

    pub fn required_fields(&self) -> &[usize] {
        self.expression.required_fields()
    }

    pub fn address_class(&self) -> Option<AddressClass> {
        self.required_registers().first().map(|a| a.class)
    }

    /// `Block.Field`, used in logs and query descriptions
    pub fn qualified_id(&self) -> String {
        format!("{}.{}", self.block_id, self.id)
    }
}

/// Lifecycle of a field with respect to the update cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldState {
    Unneeded,
    NeededStale,
    NeededFresh,
}

impl fmt::Display for FieldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unneeded => "unneeded",
            Self::NeededStale => "stale",
            Self::NeededFresh => "fresh",
        })
    }
}

/// Mutable state of one field
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldRuntime {
    /// Needed explicitly, dependencies are derived from this
    pub needed: bool,
    /// Absent after a successful decode means the device has no value
    pub value: Option<Value>,
    /// Fetch time of the oldest data behind the cached value
    pub timestamp: Option<i64>,
    /// Message of the most recent failed decode
    pub last_error: Option<String>,
}

impl FieldRuntime {
    pub fn is_decoded(&self) -> bool {
        self.timestamp.is_some()
    }

    pub fn is_fresh(&self, now: i64, max_age: i64) -> bool {
        self.timestamp.is_some_and(|ts| now - ts <= max_age)
    }

    /// `needed` covers both explicit needs and needs through a dependent field
    pub fn state(&self, needed: bool, immutable: bool, now: i64, max_age: i64) -> FieldState {
        if !needed {
            FieldState::Unneeded
        } else if (immutable && self.is_decoded()) || self.is_fresh(now, max_age) {
            FieldState::NeededFresh
        } else {
            FieldState::NeededStale
        }
    }

    pub fn store(&mut self, value: Option<Value>, timestamp: i64) {
        self.value = value;
        self.timestamp = Some(timestamp);
        self.last_error = None;
    }
}

impl FieldValues for Vec<FieldRuntime> {
    fn field_value(&self, index: usize) -> Option<&Value> {
        self.get(index).and_then(|f| f.value.as_ref())
    }
}

/// Everything the update cycle mutates: field states and cached registers
#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    pub fields: Vec<FieldRuntime>,
    pub registers: RegisterStore,
}

impl RuntimeState {
    pub fn new(field_count: usize) -> Self {
        Self {
            fields: vec![FieldRuntime::default(); field_count],
            registers: RegisterStore::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_field_state() {
        let mut runtime = FieldRuntime::default();
        assert_eq!(runtime.state(false, false, 0, 1000), FieldState::Unneeded);
        assert_eq!(runtime.state(true, false, 0, 1000), FieldState::NeededStale);

        runtime.store(Some(Value::Long(1)), 10_000);
        assert_eq!(runtime.state(true, false, 10_500, 1000), FieldState::NeededFresh);
        assert_eq!(runtime.state(true, false, 11_001, 1000), FieldState::NeededStale);
        assert_eq!(runtime.state(true, true, 99_999, 1000), FieldState::NeededFresh);
        assert_eq!(runtime.state(false, true, 99_999, 1000), FieldState::Unneeded);
    }

    #[test]
    fn test_absent_value_still_counts_as_decoded() {
        let mut runtime = FieldRuntime {
            last_error: Some("previous".into()),
            ..Default::default()
        };
        runtime.store(None, 5);
        assert!(runtime.is_decoded());
        assert_eq!(runtime.value, None);
        assert_eq!(runtime.last_error, None);
    }
}
