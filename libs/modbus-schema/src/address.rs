//! Modbus address classes and register addresses
//!
//! Supported textual forms (case-insensitive, surrounding whitespace ignored):
//!
//! | Form | Example | Meaning |
//! |------|---------|---------|
//! | `<label>:<physical>` | `hr:00123`, `holding-register:123` | physical address 123 |
//! | `<digit>x<register>` | `4x00124` | register number 124 = physical 123 |
//! | `<digit><4-5 digits>` | `40124`, `400124` | Modicon register number |

use errors::CompileError;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Maximum number of registers a single Modbus read request may return.
///
/// A read response PDU is limited to 253 bytes: 1 byte function code,
/// 1 byte byte-count and 2 bytes per register, so 125 registers at most.
pub const MODBUS_MAX_REGISTERS_PER_REQUEST: usize = 125;

/// Highest physical address in any address class
pub const MAX_PHYSICAL_ADDRESS: u32 = 0xFFFF;

// ============================================================================
// AddressClass
// ============================================================================

/// The Modbus address space a value lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressClass {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl AddressClass {
    pub const ALL: [AddressClass; 4] = [
        AddressClass::Coil,
        AddressClass::DiscreteInput,
        AddressClass::InputRegister,
        AddressClass::HoldingRegister,
    ];

    /// Leading digit in the Modicon notation
    pub fn base_digit(self) -> u32 {
        match self {
            Self::Coil => 0,
            Self::DiscreteInput => 1,
            Self::InputRegister => 3,
            Self::HoldingRegister => 4,
        }
    }

    pub fn short_label(self) -> &'static str {
        match self {
            Self::Coil => "c",
            Self::DiscreteInput => "di",
            Self::InputRegister => "ir",
            Self::HoldingRegister => "hr",
        }
    }

    pub fn long_label(self) -> &'static str {
        match self {
            Self::Coil => "coil",
            Self::DiscreteInput => "discrete-input",
            Self::InputRegister => "input-register",
            Self::HoldingRegister => "holding-register",
        }
    }

    /// Whether values of this class are 16-bit registers (as opposed to single bits)
    pub fn is_register(self) -> bool {
        matches!(self, Self::InputRegister | Self::HoldingRegister)
    }

    pub fn from_base_digit(digit: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.base_digit() == digit)
    }

    /// Find the class for any of its accepted labels
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_lowercase().replace(['_', ' '], "-");
        match label.as_str() {
            "c" | "coil" | "coils" | "0" => Some(Self::Coil),
            "di" | "discrete-input" | "discrete-inputs" | "1" => Some(Self::DiscreteInput),
            "ir" | "input-register" | "input-registers" | "3" => Some(Self::InputRegister),
            "hr" | "holding-register" | "holding-registers" | "4" => Some(Self::HoldingRegister),
            _ => None,
        }
    }
}

impl fmt::Display for AddressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.long_label())
    }
}

impl FromStr for AddressClass {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| {
            CompileError::invalid_address(format!("Unknown address class \"{}\"", s))
        })
    }
}

// ============================================================================
// Address
// ============================================================================

/// A single register (or bit) address: class plus physical address
///
/// Ordering is by class first, then by physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub class: AddressClass,
    pub physical: u16,
}

struct AddressPatterns {
    colon: Regex,
    x_format: Regex,
    digits: Regex,
}

static PATTERNS: LazyLock<Result<AddressPatterns, regex::Error>> = LazyLock::new(|| {
    Ok(AddressPatterns {
        colon: Regex::new(r"^([a-z_ -]+):(\d+)$")?,
        x_format: Regex::new(r"^(\d)x(\d+)$")?,
        digits: Regex::new(r"^(\d)(\d{4,5})$")?,
    })
});

impl Address {
    pub fn new(class: AddressClass, physical: u16) -> Self {
        Self { class, physical }
    }

    /// Create an address, validating the physical address range
    pub fn of(class: AddressClass, physical: i64) -> Result<Self, CompileError> {
        u16::try_from(physical)
            .map(|physical| Self { class, physical })
            .map_err(|_| {
                CompileError::invalid_address(format!(
                    "Invalid Modbus register address specified for {}: {}",
                    class.long_label(),
                    physical
                ))
            })
    }

    /// Parse any of the supported textual forms
    pub fn parse(tag: &str) -> Result<Self, CompileError> {
        let patterns = PATTERNS
            .as_ref()
            .map_err(|e| CompileError::invalid(format!("Address patterns unavailable: {}", e)))?;
        let cleaned = tag.trim().to_lowercase();
        let unparsable = || {
            CompileError::invalid_address(format!("Unable to parse the register tag \"{}\"", tag))
        };

        if let Some(caps) = patterns.colon.captures(&cleaned) {
            let class = AddressClass::from_label(&caps[1]).ok_or_else(unparsable)?;
            let physical: i64 = caps[2].parse().map_err(|_| unparsable())?;
            return Self::of(class, physical);
        }

        let caps = patterns
            .x_format
            .captures(&cleaned)
            .or_else(|| patterns.digits.captures(&cleaned))
            .ok_or_else(unparsable)?;
        let digit: u32 = caps[1].parse().map_err(|_| unparsable())?;
        let class = AddressClass::from_base_digit(digit).ok_or_else(unparsable)?;
        let register_number: i64 = caps[2].parse().map_err(|_| unparsable())?;
        Self::of(class, register_number - 1)
    }

    /// One-based register number as used by the Modicon notations
    pub fn register_number(self) -> u32 {
        u32::from(self.physical) + 1
    }

    /// `40124` style, absent when the register number does not fit in 4 digits
    pub fn to_modicon5(self) -> Option<String> {
        let number = self.register_number();
        (number <= 9999).then(|| format!("{}{:04}", self.class.base_digit(), number))
    }

    /// `400124` style
    pub fn to_modicon6(self) -> String {
        format!("{}{:05}", self.class.base_digit(), self.register_number())
    }

    /// `4x00124` style
    pub fn to_modicon_x(self) -> String {
        format!("{}x{:05}", self.class.base_digit(), self.register_number())
    }

    /// The address `step` positions further, if still within range
    pub fn increment(self, step: u16) -> Option<Self> {
        self.physical
            .checked_add(step)
            .map(|physical| Self::new(self.class, physical))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:05}", self.class.short_label(), self.physical)
    }
}

impl FromStr for Address {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
