//! Replay register dumps through the update cycle of a schema

use crate::schema::print_problems;
use anyhow::{anyhow, Context, Result};
use colored::*;
use common::{get_config_value, RuntimeConfig};
use modbus_schema::{
    loader, Address, Device, MockedModbusDevice, QueryStatus, RegisterBlock, UpdateReport,
};
use std::path::{Path, PathBuf};
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::{debug, info};

/// One `--input` argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpInput {
    pub first: Address,
    pub file: PathBuf,
}

/// Parse `<first address>=<file>`
pub fn parse_input(text: &str) -> Result<DumpInput> {
    let (address, file) = text
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected <address>=<file>, got \"{}\"", text))?;
    let first = Address::parse(address.trim())
        .with_context(|| format!("Invalid first address in \"{}\"", text))?;
    let file = file.trim();
    if file.is_empty() {
        return Err(anyhow!("Missing dump file in \"{}\"", text));
    }
    Ok(DumpInput {
        first,
        file: PathBuf::from(file),
    })
}

pub async fn read_dump(input: &DumpInput) -> Result<RegisterBlock> {
    let text = tokio::fs::read_to_string(&input.file)
        .await
        .with_context(|| format!("Unable to read {}", input.file.display()))?;
    let block = RegisterBlock::from_text(input.first, &text)
        .with_context(|| format!("Invalid register dump {}", input.file.display()))?;
    debug!(
        "Read {} registers from {} starting at {}",
        block.len(),
        input.file.display(),
        input.first
    );
    Ok(block)
}

/// Run `cycles` full update cycles against the dumps
///
/// The first cycle fetches every field. Later cycles only fetch what is
/// older than `max_age_ms` or failed before.
pub async fn replay(
    device: &Device,
    blocks: &[RegisterBlock],
    cycles: usize,
    max_age_ms: u64,
    max_concurrent_requests: usize,
) -> Vec<UpdateReport> {
    let transport = blocks
        .iter()
        .fold(MockedModbusDevice::new(), |mock, block| mock.with_block(block))
        .with_max_concurrent_requests(max_concurrent_requests);
    let mut reports = Vec::with_capacity(cycles);
    for _ in 0..cycles.max(1) {
        reports.push(device.update_all(&transport, max_age_ms).await);
    }
    reports
}

pub fn value_table(device: &Device) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Block", "Field", "Value", "Unit", "Error"]);
    for field in device.fields() {
        builder.push_record([
            field.block_id().to_string(),
            field.id().to_string(),
            field
                .value()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            field.unit().to_string(),
            field.last_error().unwrap_or_default(),
        ]);
    }
    let mut table = builder.build();
    table.with(Style::ascii());
    table.to_string()
}

pub fn query_table(report: &UpdateReport) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Address", "Count", "Status", "Duration", "Fields"]);
    for query in &report.queries {
        let status = match &query.status {
            QueryStatus::NotFetched => "not fetched".to_string(),
            QueryStatus::Success => "ok".to_string(),
            QueryStatus::Error(message) => message.clone(),
        };
        builder.push_record([
            query.first_address().to_string(),
            query.count.to_string(),
            status,
            query
                .duration
                .map(|d| format!("{} us", d.as_micros()))
                .unwrap_or_default(),
            query.field_ids.join(", "),
        ]);
    }
    let mut table = builder.build();
    table.with(Style::ascii());
    table.to_string()
}

pub async fn replay_command(
    schema: &Path,
    inputs: &[String],
    cycles: usize,
    max_age: Option<u64>,
    config: &RuntimeConfig,
) -> Result<()> {
    let device = loader::load_file(schema)
        .await
        .with_context(|| format!("Unable to load {}", schema.display()))?
        .with_allowed_gap(config.allowed_gap);

    let mut blocks = Vec::new();
    for input in inputs {
        blocks.push(read_dump(&parse_input(input)?).await?);
    }

    let max_age_ms = get_config_value(max_age, "MODSCHEMA_MAX_AGE_MS", config.max_age_ms);
    let reports = replay(
        &device,
        &blocks,
        cycles,
        max_age_ms,
        config.max_concurrent_requests,
    )
    .await;

    println!("{}", "Field values".bright_cyan());
    println!("{}", value_table(&device));
    for (cycle, report) in reports.iter().enumerate() {
        info!(
            "Cycle {}: {} queries, {} field errors",
            cycle + 1,
            report.request_count(),
            report.field_errors.len()
        );
        println!(
            "\n{} {}",
            "Queries of cycle".bright_cyan(),
            (cycle + 1).to_string().bright_cyan()
        );
        println!("{}", query_table(report));
    }
    print_problems(&device.initialization_problems());
    Ok(())
}
