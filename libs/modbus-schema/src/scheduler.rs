//! Decides which fields are stale and which registers must be fetched

use crate::address::AddressClass;
use crate::field::{CompiledField, RuntimeState};
use crate::register::{ReadErrorKind, RegisterSource};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// The registers of one field, fetched as a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchUnit {
    pub class: AddressClass,
    pub start: u16,
    pub count: u16,
    /// Field index
    pub field: usize,
    /// `Block.Field`
    pub field_id: String,
    /// Contains a register that failed in a shared request; gets its own query
    pub isolated: bool,
}

impl FetchUnit {
    /// One past the last register
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Stale fields in dependency order
    pub stale_fields: Vec<usize>,
    pub units: Vec<FetchUnit>,
    /// Stale fields that cannot be fetched because of a hard read error
    pub unreadable_fields: Vec<usize>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.stale_fields.is_empty()
    }

    /// Registers to fetch, sorted and deduplicated per class
    pub fn registers_by_class(&self) -> BTreeMap<AddressClass, BTreeSet<u16>> {
        let mut registers: BTreeMap<AddressClass, BTreeSet<u16>> = BTreeMap::new();
        for unit in &self.units {
            let last = unit.start.saturating_add(unit.count.saturating_sub(1));
            registers.entry(unit.class).or_default().extend(unit.start..=last);
        }
        registers
    }
}

/// The given fields plus everything they depend on, transitively
pub fn dependency_closure(
    fields: &[CompiledField],
    roots: impl IntoIterator<Item = usize>,
) -> BTreeSet<usize> {
    let mut closure = BTreeSet::new();
    let mut pending: Vec<usize> = roots.into_iter().collect();
    while let Some(index) = pending.pop() {
        if closure.insert(index) {
            if let Some(field) = fields.get(index) {
                pending.extend_from_slice(field.required_fields());
            }
        }
    }
    closure
}

/// Every needed field plus everything it depends on
pub fn needed_closure(fields: &[CompiledField], state: &RuntimeState) -> BTreeSet<usize> {
    let needed = state
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.needed)
        .map(|(i, _)| i);
    dependency_closure(fields, needed)
}

/// Fields a cycle may refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Needed fields and their dependencies
    Needed,
    /// Every field, whatever its needed flag
    All,
    /// One field and its dependencies
    Field(usize),
}

impl Scope {
    pub fn fields(self, fields: &[CompiledField], state: &RuntimeState) -> BTreeSet<usize> {
        match self {
            Self::Needed => needed_closure(fields, state),
            Self::All => (0..fields.len()).collect(),
            Self::Field(index) => dependency_closure(fields, [index]),
        }
    }
}

/// Compute the stale fields and the fetch units needed to refresh them
///
/// `order` must be a topological order of `fields`.
pub fn schedule(
    fields: &[CompiledField],
    order: &[usize],
    state: &RuntimeState,
    scope: Scope,
    max_age: i64,
    now: i64,
) -> Plan {
    let in_scope = scope.fields(fields, state);
    let mut stale = vec![false; fields.len()];
    let mut plan = Plan::default();

    for &index in order {
        if !in_scope.contains(&index) {
            continue;
        }
        let (Some(field), Some(runtime)) = (fields.get(index), state.fields.get(index)) else {
            continue;
        };
        if field.immutable && runtime.is_decoded() {
            continue;
        }
        let upstream_stale = field
            .required_fields()
            .iter()
            .any(|dep| stale.get(*dep).copied().unwrap_or(false));
        if runtime.is_fresh(now, max_age) && !upstream_stale {
            continue;
        }
        stale[index] = true;
        plan.stale_fields.push(index);

        let registers = field.required_registers();
        let (Some(first), Some(last)) = (registers.first(), registers.last()) else {
            continue;
        };
        let values: Vec<_> = registers
            .iter()
            .map(|a| state.registers.register(*a).copied().unwrap_or_default())
            .collect();
        if values.iter().any(|v| v.is_hard_read_error()) {
            plan.unreadable_fields.push(index);
            continue;
        }
        if values.iter().all(|v| v.is_fresh(now, max_age)) {
            continue;
        }
        plan.units.push(FetchUnit {
            class: first.class,
            start: first.physical,
            count: last.physical - first.physical + 1,
            field: index,
            field_id: field.qualified_id(),
            isolated: values
                .iter()
                .any(|v| v.read_error == Some(ReadErrorKind::Soft)),
        });
    }

    debug!(
        "Scheduled {} stale fields, {} fetch units, {} unreadable",
        plan.stale_fields.len(),
        plan.units.len(),
        plan.unreadable_fields.len()
    );
    plan
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::expression::{Expression, FieldBinding};
    use crate::field::FieldRuntime;
    use crate::value::Value;
    use std::collections::HashMap;

    /// Scale (hr:10), Raw (hr:0), Value = Raw * 10^Scale, Name (hr:20..hr:23)
    fn fields() -> Vec<CompiledField> {
        let mut context: HashMap<String, FieldBinding> = HashMap::new();
        let mut compiled = Vec::new();
        for (id, text, immutable) in [
            ("Scale", "int16(hr:10)", true),
            ("Raw", "uint16(hr:0)", false),
            ("Value", "Raw * 10^Scale", false),
            ("Name", "utf8(hr:20#4)", false),
        ] {
            let expression = Expression::compile(text, &context).unwrap();
            context.insert(
                id.to_string(),
                FieldBinding {
                    index: compiled.len(),
                    return_type: expression.return_type(),
                },
            );
            compiled.push(CompiledField {
                block: 0,
                block_id: "B".into(),
                id: id.into(),
                description: String::new(),
                unit: String::new(),
                system: false,
                declared_immutable: immutable,
                immutable,
                expression,
            });
        }
        compiled
    }

    fn need(state: &mut RuntimeState, index: usize) {
        state.fields[index].needed = true;
    }

    #[test]
    fn test_needed_closure_follows_dependencies() {
        let fields = fields();
        let mut state = RuntimeState::new(fields.len());
        need(&mut state, 2);
        assert_eq!(
            needed_closure(&fields, &state).into_iter().collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_nothing_decoded_everything_stale() {
        let fields = fields();
        let mut state = RuntimeState::new(fields.len());
        need(&mut state, 2);
        let plan = schedule(&fields, &[0, 1, 2, 3], &state, Scope::Needed, 1000, 10_000);
        assert_eq!(plan.stale_fields, vec![0, 1, 2]);
        assert_eq!(plan.units.len(), 2);
        assert_eq!(plan.units[0].start, 10);
        assert_eq!(plan.units[1].start, 0);
        assert!(plan.units.iter().all(|u| u.count == 1 && !u.isolated));
        assert_eq!(
            plan.registers_by_class()[&AddressClass::HoldingRegister]
                .iter()
                .copied()
                .collect::<Vec<_>>(),
            vec![0, 10]
        );
    }

    #[test]
    fn test_fresh_and_immutable_fields_are_skipped() {
        let fields = fields();
        let mut state = RuntimeState::new(fields.len());
        need(&mut state, 2);
        state.fields[0].store(Some(Value::Long(-1)), 0);
        state.fields[1].store(Some(Value::Long(5)), 9_500);
        state.fields[2].store(Some(Value::Double(0.5)), 9_500);

        let plan = schedule(&fields, &[0, 1, 2, 3], &state, Scope::Needed, 1000, 10_000);
        assert!(plan.is_empty());
        assert!(plan.units.is_empty());

        // Raw expires, Value follows it, Scale stays cached
        let plan = schedule(&fields, &[0, 1, 2, 3], &state, Scope::Needed, 1000, 10_600);
        assert_eq!(plan.stale_fields, vec![1, 2]);
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].field, 1);
    }

    #[test]
    fn test_fresh_registers_are_not_refetched() {
        let fields = fields();
        let mut state = RuntimeState::new(fields.len());
        need(&mut state, 1);
        state
            .registers
            .block_mut(AddressClass::HoldingRegister)
            .set_value(0, 7, 9_900);
        let plan = schedule(&fields, &[0, 1, 2, 3], &state, Scope::Needed, 1000, 10_000);
        assert_eq!(plan.stale_fields, vec![1]);
        assert!(plan.units.is_empty());
    }

    #[test]
    fn test_read_errors() {
        let fields = fields();
        let mut state = RuntimeState::new(fields.len());
        need(&mut state, 1);
        need(&mut state, 3);
        let block = state.registers.block_mut(AddressClass::HoldingRegister);
        block.set_read_error(0, ReadErrorKind::Hard, 0);
        block.set_read_error(21, ReadErrorKind::Soft, 0);

        let plan = schedule(&fields, &[0, 1, 2, 3], &state, Scope::Needed, 1000, 10_000);
        assert_eq!(plan.unreadable_fields, vec![1]);
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].start, 20);
        assert_eq!(plan.units[0].count, 4);
        assert!(plan.units[0].isolated);
    }

    #[test]
    fn test_unneeded_fields_are_ignored() {
        let fields = fields();
        let state = RuntimeState {
            fields: vec![FieldRuntime::default(); 4],
            ..Default::default()
        };
        assert!(schedule(&fields, &[0, 1, 2, 3], &state, Scope::Needed, 0, 0).is_empty());
    }

    #[test]
    fn test_scope_ignores_needed_flags() {
        let fields = fields();
        let state = RuntimeState::new(fields.len());
        let plan = schedule(&fields, &[0, 1, 2, 3], &state, Scope::All, 1000, 10_000);
        assert_eq!(plan.stale_fields, vec![0, 1, 2, 3]);

        let plan = schedule(&fields, &[0, 1, 2, 3], &state, Scope::Field(2), 1000, 10_000);
        assert_eq!(plan.stale_fields, vec![0, 1, 2]);
        assert!(state.fields.iter().all(|f| !f.needed));
    }
}
