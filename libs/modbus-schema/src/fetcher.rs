//! The update cycle: schedule, batch, fetch and decode
//!
//! A cycle takes a snapshot of the runtime state under a read lock, issues the
//! batched queries without holding any lock, then commits register values and
//! decodes the stale fields under a single write lock. Cycles on one device are
//! serialized by the device's update gate.

use crate::batcher::{ModbusQuery, QueryStatus, RequestBatcher};
use crate::device::{Device, FieldRef};
use crate::error::{CommunicationError, DecodeError};
use crate::evaluator::evaluate;
use crate::field::{CompiledField, RuntimeState};
use crate::register::{ReadErrorKind, RegisterSource};
use crate::scheduler::{schedule, Scope};
use crate::time::TimeProvider;
use crate::transport::ModbusTransport;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

/// Why a field was not refreshed in a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldFailure {
    Decode(DecodeError),
    Communication(String),
}

impl fmt::Display for FieldFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "{}", e),
            Self::Communication(message) => write!(f, "Communication failure: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub block: String,
    pub field: String,
    pub failure: FieldFailure,
}

/// Outcome of one update cycle
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    /// Issued queries, ordered by class and address
    pub queries: Vec<ModbusQuery>,
    pub field_errors: Vec<FieldError>,
    /// Registers received from the transport
    pub fetched_registers: usize,
}

impl UpdateReport {
    pub fn request_count(&self) -> usize {
        self.queries.len()
    }

    pub fn failed_queries(&self) -> impl Iterator<Item = &ModbusQuery> + '_ {
        self.queries
            .iter()
            .filter(|q| matches!(q.status, QueryStatus::Error(_)))
    }

    pub fn is_success(&self) -> bool {
        self.field_errors.is_empty() && self.failed_queries().next().is_none()
    }
}

impl Device {
    /// Refresh every needed field older than `max_age_ms`
    pub async fn update(&self, transport: &dyn ModbusTransport, max_age_ms: u64) -> UpdateReport {
        let _gate = self.gate.lock().await;
        self.cycle(transport, Scope::Needed, max_age_ms).await
    }

    /// Refresh one field, and what it depends on, whether needed or not
    pub async fn update_field(
        &self,
        transport: &dyn ModbusTransport,
        field: FieldRef<'_>,
        max_age_ms: u64,
    ) -> UpdateReport {
        let _gate = self.gate.lock().await;
        self.cycle(transport, Scope::Field(field.index()), max_age_ms).await
    }

    /// Refresh every field older than `max_age_ms`; needed flags stay as they are
    pub async fn update_all(
        &self,
        transport: &dyn ModbusTransport,
        max_age_ms: u64,
    ) -> UpdateReport {
        let _gate = self.gate.lock().await;
        {
            let all: BTreeSet<usize> = (0..self.compiled_fields().len()).collect();
            self.retry_read_errors(&mut self.state.write(), &all);
        }
        self.cycle(transport, Scope::All, max_age_ms).await
    }

    async fn cycle(
        &self,
        transport: &dyn ModbusTransport,
        scope: Scope,
        max_age_ms: u64,
    ) -> UpdateReport {
        run_cycle(
            self.compiled_fields(),
            self.topological_order(),
            &self.state,
            transport,
            self.batcher(),
            scope,
            i64::try_from(max_age_ms).unwrap_or(i64::MAX),
            self.time.as_ref(),
        )
        .await
    }
}

/// Fetch time of the oldest data behind a value: its registers and its
/// mutable upstream fields. Constants get `fallback`.
fn data_timestamp(
    field: &CompiledField,
    fields: &[CompiledField],
    state: &RuntimeState,
    fallback: i64,
) -> i64 {
    let registers = field
        .required_registers()
        .iter()
        .filter_map(|address| state.registers.register(*address).and_then(|r| r.fetched_at));
    let upstream = field
        .required_fields()
        .iter()
        .filter(|dep| fields.get(**dep).is_some_and(|f| !f.immutable))
        .filter_map(|dep| state.fields.get(*dep).and_then(|f| f.timestamp));
    registers.chain(upstream).min().unwrap_or(fallback)
}

/// One cycle against an arbitrary runtime state
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_cycle(
    fields: &[CompiledField],
    order: &[usize],
    state: &RwLock<RuntimeState>,
    transport: &dyn ModbusTransport,
    batcher: RequestBatcher,
    scope: Scope,
    max_age: i64,
    time: &dyn TimeProvider,
) -> UpdateReport {
    let now = time.now_millis();
    let (plan, suspects) = {
        let snapshot = state.read();
        let plan = schedule(fields, order, &snapshot, scope, max_age, now);
        let classes: BTreeSet<_> = plan.units.iter().map(|u| u.class).collect();
        let suspects: BTreeMap<_, _> = classes
            .into_iter()
            .map(|class| (class, snapshot.registers.read_error_addresses(class)))
            .collect();
        (plan, suspects)
    };
    if plan.is_empty() {
        return UpdateReport::default();
    }

    let queries = batcher.plan(&plan.units, &suspects);
    let concurrency = transport.max_concurrent_requests().max(1);
    let results: Vec<(ModbusQuery, Result<Vec<u16>, CommunicationError>)> =
        stream::iter(queries.into_iter().map(|mut query| async move {
            debug!("Fetching {} for {}", query, query.field_ids.join(", "));
            let started = Instant::now();
            let result = transport.read(query.class, query.start, query.count).await;
            query.duration = Some(started.elapsed());
            (query, result)
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut guard = state.write();
    let state = &mut *guard;
    let fetched_at = time.now_millis();
    let mut report = UpdateReport::default();
    let mut failed: BTreeMap<usize, FieldFailure> = BTreeMap::new();

    // ===== Commit register values =====
    for (mut query, result) in results {
        let result = result.and_then(|values| {
            if values.len() == usize::from(query.count) {
                Ok(values)
            } else {
                Err(CommunicationError::disconnected(format!(
                    "Expected {} registers, received {}",
                    query.count,
                    values.len()
                )))
            }
        });
        match result {
            Ok(values) => {
                let block = state.registers.block_mut(query.class);
                for (address, value) in query.addresses().zip(values) {
                    block.set_value(address.physical, value, fetched_at);
                }
                report.fetched_registers += usize::from(query.count);
                query.status = QueryStatus::Success;
            },
            Err(e) => {
                warn!("Query {} failed: {}", query.first_address(), e);
                if e.is_address_related() {
                    let kind = if query.fields.len() > 1 {
                        ReadErrorKind::Soft
                    } else {
                        ReadErrorKind::Hard
                    };
                    let block = state.registers.block_mut(query.class);
                    for address in query.addresses() {
                        block.set_read_error(address.physical, kind, fetched_at);
                    }
                }
                for field in &query.fields {
                    failed
                        .entry(*field)
                        .or_insert_with(|| FieldFailure::Communication(e.to_string()));
                }
                query.status = QueryStatus::Error(e.to_string());
            },
        }
        report.queries.push(query);
    }
    report
        .queries
        .sort_by_key(|q| (q.class, q.start, q.count));

    // ===== Decode in dependency order =====
    for &index in &plan.stale_fields {
        let Some(field) = fields.get(index) else {
            continue;
        };
        if !failed.contains_key(&index) {
            if let Some(dependency) = field
                .required_fields()
                .iter()
                .find(|dep| failed.contains_key(dep))
            {
                let name = fields
                    .get(*dependency)
                    .map(CompiledField::qualified_id)
                    .unwrap_or_default();
                failed.insert(
                    index,
                    FieldFailure::Decode(DecodeError::missing_dependency(name)),
                );
            }
        }
        if let Some(failure) = failed.get(&index) {
            if let Some(runtime) = state.fields.get_mut(index) {
                runtime.last_error = Some(failure.to_string());
            }
            continue;
        }

        match evaluate(&field.expression, &state.registers, &state.fields) {
            Ok(value) => {
                let timestamp = data_timestamp(field, fields, state, fetched_at);
                if let Some(runtime) = state.fields.get_mut(index) {
                    runtime.store(value, timestamp);
                }
            },
            Err(e) => {
                warn!("Unable to decode {}: {}", field.qualified_id(), e);
                if let Some(runtime) = state.fields.get_mut(index) {
                    runtime.last_error = Some(e.to_string());
                }
                failed.insert(index, FieldFailure::Decode(e));
            },
        }
    }

    report.field_errors = failed
        .into_iter()
        .filter_map(|(index, failure)| {
            fields.get(index).map(|field| FieldError {
                block: field.block_id.clone(),
                field: field.id.clone(),
                failure,
            })
        })
        .collect();

    debug!(
        "Update cycle: {} queries, {} registers, {} field errors",
        report.queries.len(),
        report.fetched_registers,
        report.field_errors.len()
    );
    report
}
