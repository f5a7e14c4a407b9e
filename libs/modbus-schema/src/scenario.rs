//! Replays literal register dumps against expected field values
//!
//! Each scenario runs the regular update cycle against a [`MockedModbusDevice`]
//! fed from its fixtures, on a scratch runtime state, so verification never
//! disturbs the live cache of the device.

use crate::address::Address;
use crate::batcher::RequestBatcher;
use crate::definition::{TestBlock, TestDefinition, TestRegisters};
use crate::device::Device;
use crate::error::{Result, ScenarioMismatch, SchemaError};
use crate::fetcher::run_cycle;
use crate::field::RuntimeState;
use crate::mock::MockedModbusDevice;
use crate::register::RegisterBlock;
use crate::scheduler::Scope;
use crate::value::values_match;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::{debug, info, warn};

/// Register words per line when a block is written back as text
pub const WORDS_PER_LINE: usize = 10;

/// Expected values for one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedBlock {
    pub id: String,
    pub expected: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestScenario {
    pub id: String,
    pub description: Option<String>,
    pub input: Vec<RegisterBlock>,
    pub blocks: Vec<ExpectedBlock>,
}

impl TestScenario {
    pub fn from_definition(definition: &TestDefinition) -> Result<Self> {
        let input = definition
            .input
            .iter()
            .map(|registers| {
                let first = Address::parse(&registers.first_register_address)
                    .map_err(|e| SchemaError::invalid_test(&definition.id, e.to_string()))?;
                RegisterBlock::from_text(first, &registers.registers)
                    .map_err(|e| SchemaError::invalid_test(&definition.id, e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: definition.id.clone(),
            description: definition.description.clone(),
            input,
            blocks: definition
                .blocks
                .iter()
                .map(|block| ExpectedBlock {
                    id: block.id.clone(),
                    expected: block.expected.clone(),
                })
                .collect(),
        })
    }

    pub fn to_definition(&self) -> TestDefinition {
        TestDefinition {
            id: self.id.clone(),
            description: self.description.clone(),
            input: self
                .input
                .iter()
                .filter_map(|block| {
                    block.first_address().map(|first| TestRegisters {
                        first_register_address: first.to_string(),
                        registers: block.to_hex_lines(WORDS_PER_LINE),
                    })
                })
                .collect(),
            blocks: self
                .blocks
                .iter()
                .map(|block| TestBlock {
                    id: block.id.clone(),
                    expected: block.expected.clone(),
                })
                .collect(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioResult {
    pub name: String,
    pub description: Option<String>,
    pub mismatches: Vec<ScenarioMismatch>,
    /// Number of expected values compared
    pub checked: usize,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioReport {
    pub results: Vec<ScenarioResult>,
}

impl ScenarioReport {
    /// At least one scenario, and none failed
    pub fn all_passed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(ScenarioResult::passed)
    }

    pub fn failed_tests(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.passed())
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn render(&self) -> String {
        self.results
            .iter()
            .map(|result| {
                if result.passed() {
                    format!("[PASS] Schema test \"{}\"", result.name)
                } else {
                    format!(
                        "[FAIL] Schema test \"{}\":\nFailed fields:\n{}",
                        result.name,
                        mismatch_table(&result.mismatches)
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn format_values(values: &[String]) -> String {
    format!("[{}]", values.join(", "))
}

fn mismatch_table(mismatches: &[ScenarioMismatch]) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Test", "Block", "Field", "Unit", "Expected", "Actual"]);
    for mismatch in mismatches {
        builder.push_record([
            mismatch.test.clone(),
            mismatch.block.clone(),
            mismatch.field.clone(),
            mismatch.unit.clone(),
            format_values(&mismatch.expected),
            mismatch
                .reason
                .clone()
                .unwrap_or_else(|| format_values(&mismatch.actual)),
        ]);
    }
    let mut table = builder.build();
    table.with(Style::ascii());
    table.to_string()
}

// ============================================================================
// Verification
// ============================================================================

impl Device {
    /// Run every scenario embedded in the schema
    pub async fn verify_provided_tests(&self) -> ScenarioReport {
        let mut report = ScenarioReport::default();
        for test in self.tests() {
            let result = self.verify_scenario(&test).await;
            if result.passed() {
                debug!("Schema test \"{}\" passed ({} values)", result.name, result.checked);
            } else {
                warn!(
                    "Schema test \"{}\" failed with {} mismatches",
                    result.name,
                    result.mismatches.len()
                );
            }
            report.results.push(result);
        }
        report
    }

    pub async fn verify_scenario(&self, test: &TestScenario) -> ScenarioResult {
        let mut mismatches = Vec::new();
        let mismatch =
            |block: &str, field: &str, unit: &str, expected: &[String]| ScenarioMismatch {
                test: test.id.clone(),
                block: block.to_string(),
                field: field.to_string(),
                unit: unit.to_string(),
                expected: expected.to_vec(),
                actual: Vec::new(),
                reason: None,
            };

        // Resolve every expectation first
        let mut checks: Vec<(usize, &[String])> = Vec::new();
        for expected_block in &test.blocks {
            let Some(block) = self.block(&expected_block.id) else {
                mismatches.push(ScenarioMismatch {
                    reason: Some(format!("Block \"{}\" does not exist", expected_block.id)),
                    ..mismatch(&expected_block.id, "", "", &[])
                });
                continue;
            };
            for (field_id, expected) in &expected_block.expected {
                match block.field(field_id) {
                    Some(field) => checks.push((field.index(), expected.as_slice())),
                    None => mismatches.push(ScenarioMismatch {
                        reason: Some(format!("Field \"{}\" does not exist", field_id)),
                        ..mismatch(&expected_block.id, field_id, "", expected)
                    }),
                }
            }
        }

        let transport = test
            .input
            .iter()
            .fold(MockedModbusDevice::new(), |mock, block| mock.with_block(block));
        let scratch = RwLock::new(RuntimeState::new(self.compiled_fields().len()));
        {
            let mut state = scratch.write();
            for &(index, _) in &checks {
                if let Some(runtime) = state.fields.get_mut(index) {
                    runtime.needed = true;
                }
            }
        }

        // Fixtures have no registers between blocks, so never read across a gap.
        // A failed shared query is split by a second cycle.
        let batcher = RequestBatcher::new(self.max_registers_per_request()).with_allowed_gap(0);
        for _ in 0..2 {
            let report = run_cycle(
                self.compiled_fields(),
                self.topological_order(),
                &scratch,
                &transport,
                batcher,
                Scope::Needed,
                0,
                self.time.as_ref(),
            )
            .await;
            if report.failed_queries().next().is_none() {
                break;
            }
        }

        let state = scratch.read();
        for &(index, expected) in &checks {
            let field = &self.compiled_fields()[index];
            let actual = state
                .fields
                .get(index)
                .and_then(|f| f.value.as_ref())
                .map(|v| v.to_compare_strings())
                .unwrap_or_default();
            if !values_match(field.return_type(), expected, &actual) {
                mismatches.push(ScenarioMismatch {
                    actual,
                    ..mismatch(&field.block_id, &field.id, &field.unit, expected)
                });
            }
        }

        ScenarioResult {
            name: test.id.clone(),
            description: test.description.clone(),
            mismatches,
            checked: checks.len(),
        }
    }

    /// Capture the register cache and current values as a new scenario
    pub fn create_test_from_current_data(&self) -> TestScenario {
        let test = {
            let state = self.state.read();
            let oldest = state
                .registers
                .oldest_timestamp()
                .unwrap_or_else(|| self.time.now_millis());
            let at: DateTime<Utc> = DateTime::from_timestamp_millis(oldest).unwrap_or_default();

            let blocks = self
                .blocks()
                .map(|block| ExpectedBlock {
                    id: block.id().to_string(),
                    expected: block
                        .fields()
                        .map(|field| {
                            let values = state
                                .fields
                                .get(field.index())
                                .and_then(|f| f.value.as_ref())
                                .map(|v| v.to_compare_strings())
                                .unwrap_or_default();
                            (field.id().to_string(), values)
                        })
                        .collect(),
                })
                .collect();

            TestScenario {
                id: at.format("TestAt_%Y_%m_%d_%H_%M_%S").to_string(),
                description: Some(format!(
                    "Test generated from device data at {}",
                    at.to_rfc3339_opts(SecondsFormat::Millis, true)
                )),
                input: state.registers.blocks().cloned().collect(),
                blocks,
            }
        };
        info!("Created schema test \"{}\"", test.id);
        self.add_test(test.clone());
        test
    }
}
