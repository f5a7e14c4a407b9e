//! The schema device: blocks, compiled fields and their runtime state
//!
//! A [`Device`] is built once from a [`SchemaDefinition`]. Building compiles
//! every expression, resolves field references within each block, rejects
//! dependency cycles and computes a topological order used by every update.
//! Afterwards only the runtime state (needed flags, cached values and the
//! register cache) changes.

use crate::address::{AddressClass, MODBUS_MAX_REGISTERS_PER_REQUEST};
use crate::batcher::{RequestBatcher, DEFAULT_ALLOWED_GAP};
use crate::definition::{SchemaDefinition, CURRENT_SCHEMA_FEATURE_LEVEL};
use crate::error::{CompileError, ProblemReport, Result, SchemaError};
use crate::evaluator::evaluate;
use crate::expression::{Expression, FieldBinding, Node};
use crate::field::{CompiledField, FieldState, RuntimeState};
use crate::parser;
use crate::register::{RegisterSource, RegisterStore};
use crate::scenario::TestScenario;
use crate::time::{SystemTimeProvider, TimeProvider};
use crate::value::{ReturnType, Value};
use parking_lot::RwLock;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

static IDENTIFIER: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z]([a-zA-Z0-9_ ]*[a-zA-Z0-9_]+)?$"));

/// Check a field identifier
pub fn validate_identifier(id: &str) -> Result<()> {
    let pattern = IDENTIFIER
        .as_ref()
        .map_err(|e| SchemaError::configuration(format!("Identifier pattern unavailable: {}", e)))?;
    if pattern.is_match(id) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(id.to_string()))
    }
}

/// A named group of fields
#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    pub description: Option<String>,
    /// Indices into the device field table, in schema order
    pub fields: Vec<usize>,
}

pub struct Device {
    description: String,
    schema_feature_level: u32,
    max_registers: u16,
    allowed_gap: u16,
    blocks: Vec<Block>,
    block_index: FxHashMap<String, usize>,
    fields: Vec<CompiledField>,
    order: Vec<usize>,
    tests: RwLock<Vec<TestScenario>>,
    pub(crate) state: RwLock<RuntimeState>,
    pub(crate) gate: tokio::sync::Mutex<()>,
    pub(crate) time: Arc<dyn TimeProvider>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("description", &self.description)
            .field("max_registers", &self.max_registers)
            .field("blocks", &self.blocks.len())
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// A parsed but not yet bound field
struct PendingField {
    block: usize,
    id: String,
    description: String,
    unit: String,
    system: bool,
    immutable: bool,
    text: String,
    node: Option<Node>,
}

impl Device {
    /// Validate a definition and compile all of its fields
    pub fn build(definition: SchemaDefinition) -> Result<Self> {
        if definition.schema_feature_level > CURRENT_SCHEMA_FEATURE_LEVEL {
            return Err(SchemaError::UnsupportedFeatureLevel {
                found: definition.schema_feature_level,
                supported: CURRENT_SCHEMA_FEATURE_LEVEL,
            });
        }
        let max_registers = u16::try_from(definition.max_registers_per_modbus_request)
            .ok()
            .filter(|m| (1..=MODBUS_MAX_REGISTERS_PER_REQUEST as u16).contains(m))
            .ok_or(SchemaError::InvalidMaxRegisters(
                definition.max_registers_per_modbus_request,
            ))?;

        // ===== Phase 1: structure and parsing =====
        let mut blocks: Vec<Block> = Vec::new();
        let mut block_index: FxHashMap<String, usize> = FxHashMap::default();
        let mut block_fields: Vec<FxHashMap<String, usize>> = Vec::new();
        let mut pending: Vec<PendingField> = Vec::new();

        for block_definition in definition.blocks {
            let block_id = block_definition.id.trim().to_string();
            if block_id.is_empty() {
                return Err(SchemaError::InvalidIdentifier(block_definition.id));
            }
            if block_index.contains_key(&block_id) {
                return Err(SchemaError::DuplicateBlock(block_id));
            }
            let block = blocks.len();
            let mut names: FxHashMap<String, usize> = FxHashMap::default();
            let mut indices = Vec::new();

            for field_definition in block_definition.fields {
                let field_id = field_definition.id.trim().to_string();
                validate_identifier(&field_id)?;
                if names.contains_key(&field_id) {
                    return Err(SchemaError::DuplicateField {
                        block: block_id,
                        field: field_id,
                    });
                }
                let node = parser::parse(&field_definition.expression).map_err(|e| {
                    SchemaError::compile(&block_id, &field_id, &field_definition.expression, e)
                })?;
                names.insert(field_id.clone(), pending.len());
                indices.push(pending.len());
                pending.push(PendingField {
                    block,
                    id: field_id,
                    description: field_definition.description,
                    unit: field_definition.unit,
                    system: field_definition.system,
                    immutable: field_definition.immutable,
                    text: field_definition.expression,
                    node: Some(node),
                });
            }

            block_index.insert(block_id.clone(), block);
            block_fields.push(names);
            blocks.push(Block {
                id: block_id,
                description: block_definition.description,
                fields: indices,
            });
        }

        // ===== Phase 2: dependency graph =====
        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(pending.len());
        for field in &pending {
            let names = &block_fields[field.block];
            let mut deps = BTreeSet::new();
            for name in field.node.iter().flat_map(Node::field_names) {
                let index = names.get(name).copied().ok_or_else(|| {
                    SchemaError::compile(
                        &blocks[field.block].id,
                        &field.id,
                        &field.text,
                        CompileError::UnknownField(name.to_string()),
                    )
                })?;
                deps.insert(index);
            }
            dependencies.push(deps.into_iter().collect());
        }
        let qualified = |index: usize| {
            let field = &pending[index];
            format!("{}.{}", blocks[field.block].id, field.id)
        };
        let order = topological_order(&dependencies).map_err(|cycle| {
            SchemaError::CyclicDependency(cycle.into_iter().map(qualified).collect())
        })?;

        // ===== Phase 3: binding in dependency order =====
        let mut contexts: Vec<HashMap<String, FieldBinding>> = vec![HashMap::new(); blocks.len()];
        let mut compiled: Vec<Option<CompiledField>> = vec![None; pending.len()];

        for &index in &order {
            let field = &mut pending[index];
            let block_id = blocks[field.block].id.clone();
            let node = field
                .node
                .take()
                .ok_or_else(|| {
                    SchemaError::configuration(format!("Field {} compiled twice", field.id))
                })?;
            let expression = Expression::bind(node, &contexts[field.block])
                .map_err(|e| SchemaError::compile(&block_id, &field.id, &field.text, e))?;

            let classes = expression.address_classes();
            if classes.len() > 1 {
                return Err(SchemaError::MixedAddressClasses {
                    block: block_id,
                    field: field.id.clone(),
                    classes: classes
                        .iter()
                        .map(|c| c.long_label())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
            if let Some((_, count)) = expression.register_span() {
                if count > usize::from(max_registers) {
                    return Err(SchemaError::FieldTooLarge {
                        block: block_id,
                        field: field.id.clone(),
                        count,
                    });
                }
            }

            let immutable = field.immutable
                || (expression.required_registers().is_empty()
                    && expression
                        .required_fields()
                        .iter()
                        .all(|dep| compiled[*dep].as_ref().is_some_and(|f| f.immutable)));

            contexts[field.block].insert(
                field.id.clone(),
                FieldBinding {
                    index,
                    return_type: expression.return_type(),
                },
            );
            compiled[index] = Some(CompiledField {
                block: field.block,
                block_id,
                id: field.id.clone(),
                description: std::mem::take(&mut field.description),
                unit: std::mem::take(&mut field.unit),
                system: field.system,
                declared_immutable: field.immutable,
                immutable,
                expression,
            });
        }
        let fields: Vec<CompiledField> = compiled.into_iter().flatten().collect();

        let tests = definition
            .tests
            .iter()
            .map(TestScenario::from_definition)
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Built schema device \"{}\": {} blocks, {} fields, {} tests",
            definition.description,
            blocks.len(),
            fields.len(),
            tests.len()
        );

        Ok(Self {
            description: definition.description,
            schema_feature_level: definition.schema_feature_level,
            max_registers,
            allowed_gap: DEFAULT_ALLOWED_GAP,
            blocks,
            block_index,
            state: RwLock::new(RuntimeState::new(fields.len())),
            fields,
            order,
            tests: RwLock::new(tests),
            gate: tokio::sync::Mutex::new(()),
            time: Arc::new(SystemTimeProvider),
        })
    }

    pub fn with_time_provider(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = time;
        self
    }

    /// How many unneeded registers may be read to save a request
    pub fn with_allowed_gap(mut self, allowed_gap: u16) -> Self {
        self.allowed_gap = allowed_gap;
        self
    }

    // ========================================================================
    // Structure
    // ========================================================================

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schema_feature_level(&self) -> u32 {
        self.schema_feature_level
    }

    pub fn max_registers_per_request(&self) -> u16 {
        self.max_registers
    }

    pub fn allowed_gap(&self) -> u16 {
        self.allowed_gap
    }

    pub fn batcher(&self) -> RequestBatcher {
        RequestBatcher::new(self.max_registers).with_allowed_gap(self.allowed_gap)
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockRef<'_>> + '_ {
        (0..self.blocks.len()).map(move |index| BlockRef {
            device: self,
            index,
        })
    }

    /// Case-sensitive lookup
    pub fn block(&self, id: &str) -> Option<BlockRef<'_>> {
        self.block_index
            .get(id)
            .map(|index| BlockRef {
                device: self,
                index: *index,
            })
    }

    pub fn field(&self, block: &str, field: &str) -> Option<FieldRef<'_>> {
        self.block(block)?.field(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldRef<'_>> + '_ {
        (0..self.fields.len()).map(move |index| FieldRef {
            device: self,
            index,
        })
    }

    pub fn compiled_fields(&self) -> &[CompiledField] {
        &self.fields
    }

    /// Field indices, every field after the fields it depends on
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    pub fn tests(&self) -> Vec<TestScenario> {
        self.tests.read().clone()
    }

    pub fn add_test(&self, test: TestScenario) {
        self.tests.write().push(test);
    }

    pub fn now_millis(&self) -> i64 {
        self.time.now_millis()
    }

    // ========================================================================
    // Needs
    // ========================================================================

    /// The field plus everything it depends on, transitively
    pub(crate) fn dependency_closure(&self, index: usize) -> BTreeSet<usize> {
        crate::scheduler::dependency_closure(&self.fields, [index])
    }

    pub(crate) fn need_index(&self, index: usize) {
        let closure = self.dependency_closure(index);
        let mut state = self.state.write();
        if let Some(runtime) = state.fields.get_mut(index) {
            runtime.needed = true;
        }
        self.retry_read_errors(&mut state, &closure);
    }

    /// Give registers that failed earlier another chance
    pub(crate) fn retry_read_errors(&self, state: &mut RuntimeState, fields: &BTreeSet<usize>) {
        for &index in fields {
            let Some((first, count)) = self
                .fields
                .get(index)
                .and_then(|f| f.expression.register_span())
            else {
                continue;
            };
            state
                .registers
                .block_mut(first.class)
                .clear_read_errors(first.physical, count as u16);
        }
    }

    pub(crate) fn unneed_index(&self, index: usize) {
        if let Some(runtime) = self.state.write().fields.get_mut(index) {
            runtime.needed = false;
        }
    }

    pub fn need_all(&self) {
        for index in 0..self.fields.len() {
            self.need_index(index);
        }
    }

    pub fn unneed_all(&self) {
        for runtime in self.state.write().fields.iter_mut() {
            runtime.needed = false;
        }
    }

    /// Indices of every field needed directly or through a dependent field
    pub(crate) fn needed_indices(&self) -> BTreeSet<usize> {
        let state = self.state.read();
        crate::scheduler::needed_closure(&self.fields, &state)
    }

    pub fn needed_fields(&self) -> Vec<FieldRef<'_>> {
        self.needed_indices()
            .into_iter()
            .map(|index| FieldRef {
                device: self,
                index,
            })
            .collect()
    }

    // ========================================================================
    // Runtime helpers
    // ========================================================================

    /// Copy of the cached registers
    pub fn registers(&self) -> RegisterStore {
        self.state.read().registers.clone()
    }

    /// Seed the register cache, e.g. from a dump
    pub fn load_registers(&self, block: &crate::register::RegisterBlock) {
        self.state.write().registers.load(block);
    }

    /// Forget all cached values and registers; needed flags stay
    pub fn clear_cache(&self) {
        let mut state = self.state.write();
        state.registers.clear();
        for runtime in state.fields.iter_mut() {
            runtime.value = None;
            runtime.timestamp = None;
            runtime.last_error = None;
        }
    }

    /// Decode every immutable field that needs no registers
    ///
    /// Returns the number of fields that now have a value.
    pub fn resolve_immutable_fields(&self) -> usize {
        let now = self.time.now_millis();
        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut resolved = 0;
        for &index in &self.order {
            let Some(field) = self.fields.get(index) else {
                continue;
            };
            if !field.immutable || !field.required_registers().is_empty() {
                continue;
            }
            if state.fields[index].is_decoded() {
                resolved += 1;
                continue;
            }
            match evaluate(&field.expression, &state.registers, &state.fields) {
                Ok(value) => {
                    state.fields[index].store(value, now);
                    resolved += 1;
                },
                Err(e) => {
                    warn!("Unable to resolve {}: {}", field.qualified_id(), e);
                    state.fields[index].last_error = Some(e.to_string());
                },
            }
        }
        debug!("Resolved {} immutable fields without registers", resolved);
        resolved
    }

    /// Non-fatal problems: registers known to fail and failed decodes
    pub fn initialization_problems(&self) -> ProblemReport {
        let needed = self.needed_indices();
        let state = self.state.read();
        let mut report = ProblemReport::new("Initialization problems");
        for (index, field) in self.fields.iter().enumerate() {
            for address in field.required_registers() {
                let failed = state
                    .registers
                    .register(*address)
                    .is_some_and(|r| r.is_read_error());
                if failed {
                    let kind = if needed.contains(&index) {
                        "needed register"
                    } else {
                        "register"
                    };
                    report.push(
                        field.qualified_id(),
                        format!("Uses {} {} which had a read error", kind, address),
                    );
                }
            }
            if let Some(error) = state.fields.get(index).and_then(|f| f.last_error.as_ref()) {
                report.push(field.qualified_id(), format!("Last decode failed: {}", error));
            }
        }
        if !report.is_empty() {
            let count = report.len();
            report = report.with_details(format!("{} problems", count));
        }
        report
    }
}

/// Kahn's algorithm over "depends on" edges
///
/// On a cycle the error holds the indices along one cycle, first index repeated at the end.
fn topological_order(dependencies: &[Vec<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let count = dependencies.len();
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (index, deps) in dependencies.iter().enumerate() {
        for dep in deps {
            dependents[*dep].push(index);
        }
    }

    let mut ready: VecDeque<usize> = (0..count).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(count);
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for dependent in &dependents[index] {
            in_degree[*dependent] -= 1;
            if in_degree[*dependent] == 0 {
                ready.push_back(*dependent);
            }
        }
    }
    if order.len() == count {
        return Ok(order);
    }

    // Every remaining node has a remaining dependency, so walking them must loop
    let remaining: BTreeSet<usize> = (0..count).filter(|i| in_degree[*i] > 0).collect();
    let mut path: Vec<usize> = Vec::new();
    let mut current = remaining.first().copied().unwrap_or_default();
    loop {
        if let Some(start) = path.iter().position(|i| *i == current) {
            let mut cycle = path.split_off(start);
            cycle.push(current);
            return Err(cycle);
        }
        path.push(current);
        match dependencies[current].iter().find(|d| remaining.contains(d)) {
            Some(next) => current = *next,
            None => return Err(path),
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

#[derive(Clone, Copy)]
pub struct BlockRef<'a> {
    device: &'a Device,
    index: usize,
}

impl<'a> BlockRef<'a> {
    fn block(&self) -> &'a Block {
        &self.device.blocks[self.index]
    }

    pub fn id(&self) -> &'a str {
        &self.block().id
    }

    pub fn description(&self) -> Option<&'a str> {
        self.block().description.as_deref()
    }

    /// Case-sensitive lookup
    pub fn field(&self, id: &str) -> Option<FieldRef<'a>> {
        self.block()
            .fields
            .iter()
            .copied()
            .find(|index| self.device.fields[*index].id == id)
            .map(|index| FieldRef {
                device: self.device,
                index,
            })
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldRef<'a>> + 'a {
        let device = self.device;
        self.block()
            .fields
            .iter()
            .map(move |index| FieldRef {
                device,
                index: *index,
            })
    }

    pub fn need_all(&self) {
        for field in self.fields() {
            field.need();
        }
    }

    pub fn unneed_all(&self) {
        for field in self.fields() {
            field.unneed();
        }
    }
}

impl fmt::Debug for BlockRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlockRef").field(&self.id()).finish()
    }
}

#[derive(Clone, Copy)]
pub struct FieldRef<'a> {
    device: &'a Device,
    index: usize,
}

impl<'a> FieldRef<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn compiled(&self) -> &'a CompiledField {
        &self.device.fields[self.index]
    }

    pub fn id(&self) -> &'a str {
        &self.compiled().id
    }

    pub fn block_id(&self) -> &'a str {
        &self.compiled().block_id
    }

    pub fn description(&self) -> &'a str {
        &self.compiled().description
    }

    pub fn unit(&self) -> &'a str {
        &self.compiled().unit
    }

    pub fn is_system(&self) -> bool {
        self.compiled().system
    }

    pub fn is_immutable(&self) -> bool {
        self.compiled().immutable
    }

    pub fn return_type(&self) -> ReturnType {
        self.compiled().return_type()
    }

    pub fn expression(&self) -> &'a Expression {
        &self.compiled().expression
    }

    pub fn address_class(&self) -> Option<AddressClass> {
        self.compiled().address_class()
    }

    /// Keep this field, and everything it depends on, up to date
    pub fn need(&self) {
        self.device.need_index(self.index);
    }

    pub fn unneed(&self) {
        self.device.unneed_index(self.index);
    }

    pub fn is_needed(&self) -> bool {
        self.device.needed_indices().contains(&self.index)
    }

    pub fn state(&self, max_age_ms: u64) -> FieldState {
        let needed = self.is_needed();
        let now = self.device.time.now_millis();
        let max_age = i64::try_from(max_age_ms).unwrap_or(i64::MAX);
        self.device
            .state
            .read()
            .fields
            .get(self.index)
            .map(|runtime| runtime.state(needed, self.is_immutable(), now, max_age))
            .unwrap_or(FieldState::Unneeded)
    }

    /// The cached value; absent until decoded, or when the device has none
    pub fn value(&self) -> Option<Value> {
        self.device
            .state
            .read()
            .fields
            .get(self.index)
            .and_then(|f| f.value.clone())
    }

    pub fn long_value(&self) -> Option<i64> {
        match self.value()? {
            Value::Double(v) if v.is_finite() => Some(v as i64),
            other => other.as_long(),
        }
    }

    pub fn unsigned_long_value(&self) -> Option<u64> {
        self.value()?.as_unsigned_long()
    }

    pub fn double_value(&self) -> Option<f64> {
        self.value()?.as_double()
    }

    pub fn string_value(&self) -> Option<String> {
        self.value()?.as_string()
    }

    pub fn string_list_value(&self) -> Option<Vec<String>> {
        self.value()?.as_string_list().map(<[String]>::to_vec)
    }

    /// Epoch millis of the oldest register or upstream value behind the cached value
    pub fn timestamp(&self) -> Option<i64> {
        self.device
            .state
            .read()
            .fields
            .get(self.index)
            .and_then(|f| f.timestamp)
    }

    pub fn last_error(&self) -> Option<String> {
        self.device
            .state
            .read()
            .fields
            .get(self.index)
            .and_then(|f| f.last_error.clone())
    }

    /// The value as compared by scenarios; empty when absent
    pub fn compare_strings(&self) -> Vec<String> {
        self.value()
            .map(|v| v.to_compare_strings())
            .unwrap_or_default()
    }
}

impl fmt::Debug for FieldRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FieldRef")
            .field(&self.compiled().qualified_id())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::definition::{BlockDefinition, FieldDefinition};

    fn field(id: &str, expression: &str) -> FieldDefinition {
        FieldDefinition {
            id: id.to_string(),
            description: String::new(),
            immutable: false,
            system: false,
            expression: expression.to_string(),
            unit: String::new(),
        }
    }

    fn schema(fields: Vec<FieldDefinition>) -> SchemaDefinition {
        SchemaDefinition {
            description: "Test".to_string(),
            schema_feature_level: CURRENT_SCHEMA_FEATURE_LEVEL,
            max_registers_per_modbus_request: 125,
            blocks: vec![BlockDefinition {
                id: "Block".to_string(),
                description: None,
                fields,
            }],
            tests: Vec::new(),
        }
    }

    #[test]
    fn test_identifiers() {
        for good in ["Name", "Name 2", "a_b", "X"] {
            assert!(validate_identifier(good).is_ok(), "{}", good);
        }
        for bad in ["", "1Name", "Name ", "_x", "a-b"] {
            assert!(validate_identifier(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_build_orders_dependencies() {
        let device = Device::build(schema(vec![
            field("Value", "Raw * 10^Scale"),
            field("Raw", "int16(hr:0)"),
            field("Scale", "int16(hr:1)"),
        ]))
        .unwrap();
        let order = device.topological_order();
        let position = |i: usize| order.iter().position(|o| *o == i).unwrap();
        assert!(position(1) < position(0));
        assert!(position(2) < position(0));
        assert_eq!(device.field("Block", "Value").unwrap().return_type(), ReturnType::Double);
        assert!(device.field("Block", "value").is_none());
        assert!(device.block("Other").is_none());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = Device::build(schema(vec![
            field("A", "B + 1"),
            field("B", "C + 1"),
            field("C", "A + 1"),
            field("D", "int16(hr:0)"),
        ]))
        .unwrap_err();
        match err {
            SchemaError::CyclicDependency(path) => {
                assert_eq!(path.len(), 4);
                assert_eq!(path.first(), path.last());
                assert!(path.iter().all(|p| p.starts_with("Block.")));
            },
            other => panic!("Unexpected error {other:?}"),
        }
        assert!(matches!(
            Device::build(schema(vec![field("A", "A")])),
            Err(SchemaError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(
            Device::build(schema(vec![field("A", "1"), field("A", "2")])),
            Err(SchemaError::DuplicateField { .. })
        ));
        assert!(matches!(
            Device::build(schema(vec![field("A", "Missing + 1")])),
            Err(SchemaError::Compile { .. })
        ));
        assert!(matches!(
            Device::build(schema(vec![field("1A", "1")])),
            Err(SchemaError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            Device::build(schema(vec![field("A", "int16(hr:0) + int16(ir:1)")])),
            Err(SchemaError::MixedAddressClasses { .. })
        ));

        let mut definition = schema(vec![field("A", "utf8(hr:0 # 10)")]);
        definition.max_registers_per_modbus_request = 5;
        let err = Device::build(definition).unwrap_err();
        assert_eq!(
            err.to_string(),
            "In block Block the field A requires a block of 10 registers which cannot be retrieved over Modbus."
        );

        let mut definition = schema(vec![]);
        definition.max_registers_per_modbus_request = 126;
        assert!(matches!(
            Device::build(definition),
            Err(SchemaError::InvalidMaxRegisters(126))
        ));

        let mut definition = schema(vec![]);
        definition.schema_feature_level = 3;
        assert!(matches!(
            Device::build(definition),
            Err(SchemaError::UnsupportedFeatureLevel { found: 3, .. })
        ));

        let mut definition = schema(vec![]);
        definition.blocks.push(definition.blocks[0].clone());
        assert!(matches!(
            Device::build(definition),
            Err(SchemaError::DuplicateBlock(_))
        ));
    }

    #[test]
    fn test_effective_immutability() {
        let mut scale = field("Scale", "int16(hr:1)");
        scale.immutable = true;
        let device = Device::build(schema(vec![
            scale,
            field("Factor", "10^Scale"),
            field("Constant", "42"),
            field("Value", "int16(hr:0) * Factor"),
        ]))
        .unwrap();
        assert!(device.field("Block", "Factor").unwrap().is_immutable());
        assert!(device.field("Block", "Constant").unwrap().is_immutable());
        assert!(!device.field("Block", "Value").unwrap().is_immutable());
        assert!(!device.compiled_fields()[1].declared_immutable);
    }

    #[test]
    fn test_need_is_transitive_and_idempotent() {
        let device = Device::build(schema(vec![
            field("Raw", "int16(hr:0)"),
            field("Scale", "int16(hr:1)"),
            field("Value", "Raw * 10^Scale"),
            field("Other", "int16(hr:5)"),
        ]))
        .unwrap();
        let value = device.field("Block", "Value").unwrap();
        value.need();
        let once: Vec<usize> = device.needed_fields().iter().map(|f| f.index()).collect();
        value.need();
        let twice: Vec<usize> = device.needed_fields().iter().map(|f| f.index()).collect();
        assert_eq!(once, vec![0, 1, 2]);
        assert_eq!(once, twice);
        assert!(device.field("Block", "Raw").unwrap().is_needed());

        value.unneed();
        assert!(device.needed_fields().is_empty());

        device.need_all();
        assert_eq!(device.needed_fields().len(), 4);
        device.unneed_all();
        assert!(device.needed_fields().is_empty());
    }

    #[test]
    fn test_need_clears_read_errors() {
        let device = Device::build(schema(vec![field("Name", "utf8(hr:0 # 4)")])).unwrap();
        device
            .state
            .write()
            .registers
            .block_mut(AddressClass::HoldingRegister)
            .set_read_error(2, crate::register::ReadErrorKind::Hard, 0);
        let problems = device.initialization_problems();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems.details.as_deref(), Some("1 problems"));
        assert!(problems.field_errors["Block.Name"][0].contains("hr:00002"));

        device.field("Block", "Name").unwrap().need();
        assert!(device
            .registers()
            .read_error_addresses(AddressClass::HoldingRegister)
            .is_empty());
        assert!(device.initialization_problems().is_empty());
    }

    #[test]
    fn test_resolve_immutable_fields() {
        let device = Device::build(schema(vec![
            field("Answer", "42"),
            field("Label", "concat('Answer ', Answer)"),
            field("Raw", "int16(hr:0)"),
        ]))
        .unwrap();
        assert_eq!(device.resolve_immutable_fields(), 2);
        assert_eq!(device.field("Block", "Answer").unwrap().long_value(), Some(42));
        assert_eq!(
            device.field("Block", "Label").unwrap().string_value().as_deref(),
            Some("Answer 42")
        );
        assert_eq!(device.field("Block", "Raw").unwrap().value(), None);
        assert!(device.field("Block", "Answer").unwrap().timestamp().is_some());
    }
}
