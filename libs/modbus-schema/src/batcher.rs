//! Groups fetch units into bounded Modbus requests

use crate::address::{Address, AddressClass, MODBUS_MAX_REGISTERS_PER_REQUEST};
use crate::scheduler::FetchUnit;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Largest number of unneeded registers read to avoid an extra request
pub const DEFAULT_ALLOWED_GAP: u16 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    NotFetched,
    Success,
    Error(String),
}

/// One read request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusQuery {
    pub class: AddressClass,
    pub start: u16,
    pub count: u16,
    pub status: QueryStatus,
    pub duration: Option<Duration>,
    /// Field indices served by this query
    pub fields: Vec<usize>,
    /// `Block.Field` of every served field
    pub field_ids: Vec<String>,
}

impl ModbusQuery {
    fn from_unit(unit: &FetchUnit) -> Self {
        Self {
            class: unit.class,
            start: unit.start,
            count: unit.count,
            status: QueryStatus::NotFetched,
            duration: None,
            fields: vec![unit.field],
            field_ids: vec![unit.field_id.clone()],
        }
    }

    pub fn first_address(&self) -> Address {
        Address::new(self.class, self.start)
    }

    /// One past the last register
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }

    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        (0..self.count).filter_map(move |offset| self.first_address().increment(offset))
    }

    fn absorb(&mut self, unit: &FetchUnit) {
        let end = self.end().max(unit.end());
        self.count = (end - u32::from(self.start)) as u16;
        if !self.fields.contains(&unit.field) {
            self.fields.push(unit.field);
            self.field_ids.push(unit.field_id.clone());
        }
    }
}

impl fmt::Display for ModbusQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} # {}", self.first_address(), self.count)?;
        match &self.status {
            QueryStatus::NotFetched => write!(f, " (not fetched)"),
            QueryStatus::Success => match self.duration {
                Some(duration) => write!(f, " ({} ms)", duration.as_millis()),
                None => Ok(()),
            },
            QueryStatus::Error(message) => write!(f, " (failed: {})", message),
        }
    }
}

/// Merges fetch units into windows no larger than `max_registers`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBatcher {
    pub max_registers: u16,
    pub allowed_gap: u16,
}

impl Default for RequestBatcher {
    fn default() -> Self {
        Self {
            max_registers: MODBUS_MAX_REGISTERS_PER_REQUEST as u16,
            allowed_gap: DEFAULT_ALLOWED_GAP,
        }
    }
}

impl RequestBatcher {
    pub fn new(max_registers: u16) -> Self {
        Self {
            max_registers: max_registers.max(1),
            ..Default::default()
        }
    }

    pub fn with_allowed_gap(mut self, allowed_gap: u16) -> Self {
        self.allowed_gap = allowed_gap;
        self
    }

    /// Partition the units into queries
    ///
    /// Units are processed per class in address order. A unit joins the current
    /// window when the merged span fits, the gap is small enough and no
    /// suspect address lies in the gap. Isolated units always get their own query.
    pub fn plan(
        &self,
        units: &[FetchUnit],
        suspects: &BTreeMap<AddressClass, BTreeSet<u16>>,
    ) -> Vec<ModbusQuery> {
        let mut sorted: Vec<&FetchUnit> = units.iter().collect();
        sorted.sort_by_key(|u| (u.class, u.start, u.count, u.field));

        let mut queries: Vec<ModbusQuery> = Vec::new();
        let mut current: Option<(ModbusQuery, bool)> = None;

        for unit in sorted {
            if let Some((query, isolated)) = current.as_mut() {
                if !*isolated && !unit.isolated && self.fits(query, unit, suspects) {
                    query.absorb(unit);
                    continue;
                }
            }
            if let Some((query, _)) = current.take() {
                queries.push(query);
            }
            current = Some((ModbusQuery::from_unit(unit), unit.isolated));
        }
        if let Some((query, _)) = current {
            queries.push(query);
        }
        queries
    }

    fn fits(
        &self,
        query: &ModbusQuery,
        unit: &FetchUnit,
        suspects: &BTreeMap<AddressClass, BTreeSet<u16>>,
    ) -> bool {
        if query.class != unit.class {
            return false;
        }
        let span = query.end().max(unit.end()) - u32::from(query.start);
        if span > u32::from(self.max_registers) {
            return false;
        }
        let gap_start = query.end();
        let gap_end = u32::from(unit.start);
        if gap_end <= gap_start {
            return true;
        }
        if gap_end - gap_start > u32::from(self.allowed_gap) {
            return false;
        }
        let suspect_in_gap = suspects.get(&unit.class).is_some_and(|set| {
            set.range(gap_start as u16..unit.start).next().is_some()
        });
        !suspect_in_gap
    }
}
