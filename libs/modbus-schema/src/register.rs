//! Register values, register blocks and the textual register dump format
//!
//! A dump is a whitespace separated list of words, one per register:
//! up to 4 hex digits for a value, `----` or `null` for "no value" and
//! `xxxx` for a read error. `#` and `//` start a comment up to the end of the line.

use crate::address::{Address, AddressClass};
use crate::error::RegisterTextError;
use std::collections::{BTreeMap, BTreeSet};

/// Timestamp given to register values loaded from text: 2001-02-03T04:05:06.789Z
pub const FIXTURE_TIMESTAMP: i64 = 981_173_106_789;

/// Severity of a failed register read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorKind {
    /// Failed as part of a larger request, worth trying again in isolation
    Soft,
    /// Failed on its own, treated as unreadable
    Hard,
}

/// The last known state of a single 16-bit register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterValue {
    pub value: Option<u16>,
    /// Epoch millis of the last fetch attempt
    pub fetched_at: Option<i64>,
    pub read_error: Option<ReadErrorKind>,
}

impl RegisterValue {
    pub fn with_value(value: u16, fetched_at: i64) -> Self {
        Self {
            value: Some(value),
            fetched_at: Some(fetched_at),
            read_error: None,
        }
    }

    pub fn with_read_error(kind: ReadErrorKind, fetched_at: i64) -> Self {
        Self {
            value: None,
            fetched_at: Some(fetched_at),
            read_error: Some(kind),
        }
    }

    pub fn set_value(&mut self, value: u16, fetched_at: i64) {
        *self = Self::with_value(value, fetched_at);
    }

    pub fn set_read_error(&mut self, kind: ReadErrorKind, fetched_at: i64) {
        *self = Self::with_read_error(kind, fetched_at);
    }

    pub fn is_read_error(&self) -> bool {
        self.read_error.is_some()
    }

    pub fn is_hard_read_error(&self) -> bool {
        self.read_error == Some(ReadErrorKind::Hard)
    }

    /// A value fetched no longer than `max_age` millis before `now`
    pub fn is_fresh(&self, now: i64, max_age: i64) -> bool {
        match (self.value, self.fetched_at) {
            (Some(_), Some(ts)) => now - ts <= max_age,
            _ => false,
        }
    }

    /// Four character rendering used in dumps
    pub fn to_hex_word(&self) -> String {
        match (self.value, self.read_error) {
            (Some(value), _) => format!("{:04X}", value),
            (None, Some(ReadErrorKind::Soft)) => "xxxx".to_string(),
            (None, Some(ReadErrorKind::Hard)) => "XXXX".to_string(),
            (None, None) => "----".to_string(),
        }
    }

    /// Parse a single dump word
    pub fn parse_word(word: &str, fetched_at: i64) -> Result<Self, RegisterTextError> {
        let lower = word.trim().to_lowercase();
        match lower.as_str() {
            "----" | "null" => Ok(Self::default()),
            "xxxx" => Ok(Self::with_read_error(ReadErrorKind::Soft, fetched_at)),
            _ => {
                let digits = lower.strip_prefix("0x").unwrap_or(&lower);
                if digits.is_empty() || digits.len() > 4 {
                    return Err(RegisterTextError::InvalidWord(word.to_string()));
                }
                u16::from_str_radix(digits, 16)
                    .map(|value| Self::with_value(value, fetched_at))
                    .map_err(|_| RegisterTextError::InvalidWord(word.to_string()))
            },
        }
    }
}

/// Strip comments and split a register dump into its words
pub fn register_words(text: &str) -> Vec<&str> {
    text.lines()
        .map(|line| {
            let end = [line.find('#'), line.find("//")]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(line.len());
            &line[..end]
        })
        .flat_map(str::split_whitespace)
        .collect()
}

/// Lookup of register values by address
pub trait RegisterSource {
    fn register(&self, address: Address) -> Option<&RegisterValue>;
}

// ============================================================================
// RegisterBlock
// ============================================================================

/// Register values of one address class, ordered by physical address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock {
    class: AddressClass,
    values: BTreeMap<u16, RegisterValue>,
}

impl RegisterBlock {
    pub fn new(class: AddressClass) -> Self {
        Self {
            class,
            values: BTreeMap::new(),
        }
    }

    /// Build a block from a register dump starting at `first`
    pub fn from_text(first: Address, text: &str) -> Result<Self, RegisterTextError> {
        let words = register_words(text);
        let mut block = Self::new(first.class);
        for (offset, word) in words.iter().enumerate() {
            let physical = u16::try_from(offset)
                .ok()
                .and_then(|offset| first.physical.checked_add(offset))
                .ok_or(RegisterTextError::OutOfRange {
                    start: first,
                    count: words.len(),
                })?;
            block
                .values
                .insert(physical, RegisterValue::parse_word(word, FIXTURE_TIMESTAMP)?);
        }
        Ok(block)
    }

    /// Build a block from plain register values starting at `first`
    pub fn from_values(
        first: Address,
        values: &[u16],
        fetched_at: i64,
    ) -> Result<Self, RegisterTextError> {
        let out_of_range = || RegisterTextError::OutOfRange {
            start: first,
            count: values.len(),
        };
        let mut block = Self::new(first.class);
        for (offset, value) in values.iter().enumerate() {
            let offset = u16::try_from(offset).map_err(|_| out_of_range())?;
            let physical = first.physical.checked_add(offset).ok_or_else(out_of_range)?;
            block.set_value(physical, *value, fetched_at);
        }
        Ok(block)
    }

    pub fn class(&self) -> AddressClass {
        self.class
    }

    pub fn get(&self, physical: u16) -> Option<&RegisterValue> {
        self.values.get(&physical)
    }

    pub fn entry(&mut self, physical: u16) -> &mut RegisterValue {
        self.values.entry(physical).or_default()
    }

    pub fn set_value(&mut self, physical: u16, value: u16, fetched_at: i64) {
        self.entry(physical).set_value(value, fetched_at);
    }

    pub fn set_read_error(&mut self, physical: u16, kind: ReadErrorKind, fetched_at: i64) {
        self.entry(physical).set_read_error(kind, fetched_at);
    }

    /// Copy every register of `other` into this block
    pub fn merge(&mut self, other: &RegisterBlock) {
        if other.class != self.class {
            return;
        }
        for (physical, value) in &other.values {
            self.values.insert(*physical, *value);
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn first_address(&self) -> Option<Address> {
        self.values
            .keys()
            .next()
            .map(|physical| Address::new(self.class, *physical))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, &RegisterValue)> + '_ {
        self.values
            .iter()
            .map(|(physical, value)| (Address::new(self.class, *physical), value))
    }

    pub fn read_error_addresses(&self) -> BTreeSet<u16> {
        self.values
            .iter()
            .filter(|(_, v)| v.is_read_error())
            .map(|(physical, _)| *physical)
            .collect()
    }

    /// Forget read errors in `start .. start + count`
    pub fn clear_read_errors(&mut self, start: u16, count: u16) {
        let end = u32::from(start) + u32::from(count);
        for (physical, value) in self.values.range_mut(start..) {
            if u32::from(*physical) >= end {
                break;
            }
            value.read_error = None;
        }
    }

    /// All words from the first to the last known register, gaps rendered as `----`
    pub fn hex_words(&self) -> Vec<String> {
        let (Some(first), Some(last)) = (self.values.keys().next(), self.values.keys().next_back())
        else {
            return Vec::new();
        };
        (*first..=*last)
            .map(|physical| {
                self.values
                    .get(&physical)
                    .copied()
                    .unwrap_or_default()
                    .to_hex_word()
            })
            .collect()
    }

    /// Dump text with `per_line` words per line
    pub fn to_hex_lines(&self, per_line: usize) -> String {
        self.hex_words()
            .chunks(per_line.max(1))
            .map(|chunk| chunk.join(" "))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl RegisterSource for RegisterBlock {
    fn register(&self, address: Address) -> Option<&RegisterValue> {
        if address.class != self.class {
            return None;
        }
        self.values.get(&address.physical)
    }
}

// ============================================================================
// RegisterStore
// ============================================================================

/// Register blocks for all address classes of one device
#[derive(Debug, Clone, Default)]
pub struct RegisterStore {
    blocks: BTreeMap<AddressClass, RegisterBlock>,
}

impl RegisterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, class: AddressClass) -> Option<&RegisterBlock> {
        self.blocks.get(&class)
    }

    pub fn block_mut(&mut self, class: AddressClass) -> &mut RegisterBlock {
        self.blocks
            .entry(class)
            .or_insert_with(|| RegisterBlock::new(class))
    }

    pub fn blocks(&self) -> impl Iterator<Item = &RegisterBlock> + '_ {
        self.blocks.values().filter(|b| !b.is_empty())
    }

    pub fn load(&mut self, block: &RegisterBlock) {
        self.block_mut(block.class()).merge(block);
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn read_error_addresses(&self, class: AddressClass) -> BTreeSet<u16> {
        self.block(class)
            .map(RegisterBlock::read_error_addresses)
            .unwrap_or_default()
    }

    /// Oldest fetch time over all registers with a value
    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.blocks
            .values()
            .flat_map(|b| b.iter())
            .filter(|(_, v)| v.value.is_some())
            .filter_map(|(_, v)| v.fetched_at)
            .min()
    }
}

impl RegisterSource for RegisterStore {
    fn register(&self, address: Address) -> Option<&RegisterValue> {
        self.blocks
            .get(&address.class)
            .and_then(|block| block.get(address.physical))
    }
}
