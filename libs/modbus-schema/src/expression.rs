//! Compiled field expressions
//!
//! An [`Expression`] is a parsed [`Node`] tree whose field references have been
//! resolved against a [`SchemaContext`] and whose register usage and types have
//! been checked. Its `Display` output is the canonical form of the expression.

use crate::address::{Address, AddressClass, MODBUS_MAX_REGISTERS_PER_REQUEST};
use crate::codec;
use crate::error::CompileError;
use crate::parser;
use crate::value::ReturnType;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::BuildHasher;

// ============================================================================
// Building blocks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
}

impl BinaryOp {
    pub fn symbol(self) -> char {
        match self {
            Self::Add => '+',
            Self::Subtract => '-',
            Self::Multiply => '*',
            Self::Divide => '/',
            Self::Power => '^',
        }
    }
}

/// Numeric register encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberKind {
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Ieee754_32,
    Ieee754_64,
}

impl NumberKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "int16" => Self::Int16,
            "uint16" => Self::UInt16,
            "int32" => Self::Int32,
            "uint32" => Self::UInt32,
            "int64" => Self::Int64,
            "uint64" => Self::UInt64,
            "ieee754_32" => Self::Ieee754_32,
            "ieee754_64" => Self::Ieee754_64,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Ieee754_32 => "ieee754_32",
            Self::Ieee754_64 => "ieee754_64",
        }
    }

    pub fn register_count(self) -> usize {
        match self {
            Self::Int16 | Self::UInt16 => 1,
            Self::Int32 | Self::UInt32 | Self::Ieee754_32 => 2,
            Self::Int64 | Self::UInt64 | Self::Ieee754_64 => 4,
        }
    }

    pub fn return_type(self) -> ReturnType {
        match self {
            Self::Ieee754_32 | Self::Ieee754_64 => ReturnType::Double,
            _ => ReturnType::Long,
        }
    }
}

/// Network and hardware identifier encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Eui48,
    Ipv4,
    Ipv6,
}

impl IdentifierKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Eui48 => "eui48",
            Self::Ipv4 => "ipv4addr",
            Self::Ipv6 => "ipv6addr",
        }
    }
}

/// The registers an encoding reads
#[derive(Debug, Clone, PartialEq)]
pub enum Registers {
    /// Device registers, in the order written
    Addresses(Vec<Address>),
    /// Literal register values
    Constant(Vec<u16>),
    SwapEndian(Box<Registers>),
    SwapBytes(Box<Registers>),
}

impl Registers {
    pub fn count(&self) -> usize {
        match self {
            Self::Addresses(list) => list.len(),
            Self::Constant(values) => values.len(),
            Self::SwapEndian(inner) | Self::SwapBytes(inner) => inner.count(),
        }
    }

    pub fn addresses(&self) -> &[Address] {
        match self {
            Self::Addresses(list) => list,
            Self::Constant(_) => &[],
            Self::SwapEndian(inner) | Self::SwapBytes(inner) => inner.addresses(),
        }
    }

    fn is_sorted_contiguous(list: &[Address]) -> bool {
        list.windows(2).all(|pair| {
            pair[0].class == pair[1].class && pair[0].increment(1) == Some(pair[1])
        })
    }

    fn check(&self) -> Result<(), CompileError> {
        match self {
            Self::Addresses(list) => {
                if list.is_empty() {
                    return Err(CompileError::register_count("No registers"));
                }
                if list.len() > MODBUS_MAX_REGISTERS_PER_REQUEST {
                    return Err(CompileError::register_count(format!(
                        "{} registers is more than the {} a single request can retrieve",
                        list.len(),
                        MODBUS_MAX_REGISTERS_PER_REQUEST
                    )));
                }
                if let Some(discrete) = list.iter().find(|a| !a.class.is_register()) {
                    return Err(CompileError::invalid_address(format!(
                        "{} is a {} which does not hold a 16-bit register",
                        discrete,
                        discrete.class.long_label()
                    )));
                }
                let mut sorted = list.clone();
                sorted.sort();
                let unique: BTreeSet<&Address> = sorted.iter().collect();
                if unique.len() != sorted.len() {
                    return Err(CompileError::register_count(format!(
                        "Duplicate registers in {}",
                        self
                    )));
                }
                if !Self::is_sorted_contiguous(&sorted) {
                    return Err(CompileError::register_count(format!(
                        "The registers {} are not a contiguous block",
                        self
                    )));
                }
                Ok(())
            },
            Self::Constant(values) if values.is_empty() => {
                Err(CompileError::register_count("No register values"))
            },
            Self::Constant(_) => Ok(()),
            Self::SwapEndian(inner) | Self::SwapBytes(inner) => {
                inner.check()?;
                if inner.count() != 1 {
                    return Err(CompileError::register_count(format!(
                        "{} needs exactly 1 register (got {})",
                        self.swap_name(),
                        inner.count()
                    )));
                }
                Ok(())
            },
        }
    }

    fn swap_name(&self) -> &'static str {
        match self {
            Self::SwapEndian(_) => "swapendian",
            Self::SwapBytes(_) => "swapbytes",
            _ => "registers",
        }
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addresses(list) if list.len() > 1 && Self::is_sorted_contiguous(list) => {
                write!(f, "{} # {}", list[0], list.len())
            },
            Self::Addresses(list) => {
                let parts: Vec<String> = list.iter().map(Address::to_string).collect();
                f.write_str(&parts.join(", "))
            },
            Self::Constant(values) => {
                write!(f, "\"{}\"", codec::hex_string(&codec::registers_to_bytes(values)))
            },
            Self::SwapEndian(inner) => write!(f, "swapendian({})", inner),
            Self::SwapBytes(inner) => write!(f, "swapbytes({})", inner),
        }
    }
}

/// Register value patterns that mean "not implemented by this device"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotImplemented(pub Vec<Vec<u16>>);

impl NotImplemented {
    pub fn matches(&self, registers: &[u16]) -> bool {
        self.0.iter().any(|group| group.as_slice() == registers)
    }

    fn check(&self, register_count: usize) -> Result<(), CompileError> {
        match self.0.iter().find(|group| group.len() != register_count) {
            Some(group) => Err(CompileError::not_implemented(format!(
                "The not implemented value {} must have exactly {} registers",
                codec::hex_string(&codec::registers_to_bytes(group)),
                register_count
            ))),
            None => Ok(()),
        }
    }
}

impl fmt::Display for NotImplemented {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for group in &self.0 {
            let words: Vec<String> = group.iter().map(|r| format!("0x{:04X}", r)).collect();
            write!(f, " ; {}", words.join(" "))?;
        }
        Ok(())
    }
}

/// A resolved reference to another field of the same block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldBinding {
    /// Index of the field in the device field table
    pub index: usize,
    pub return_type: ReturnType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub name: String,
    pub binding: Option<FieldBinding>,
}

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Long(i64),
    /// Keeps the source text so the canonical form reads as written
    Double { value: f64, text: String },
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Number {
        kind: NumberKind,
        registers: Registers,
        not_implemented: NotImplemented,
    },
    Field(FieldRef),
    Str(String),
    Concat(Vec<Node>),
    Utf8(Registers),
    HexString(Registers),
    Identifier {
        kind: IdentifierKind,
        registers: Registers,
        not_implemented: NotImplemented,
    },
    Enum {
        registers: Registers,
        not_implemented: NotImplemented,
        mapping: Vec<(i64, String)>,
    },
    Bitset {
        registers: Registers,
        not_implemented: NotImplemented,
        mapping: Vec<(u32, String)>,
    },
}

/// Sign knowledge about a numeric sub-expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignGuarantee {
    /// Zero or larger
    Positive,
    Negative,
    Unknown,
}

impl Node {
    /// Names of all referenced fields, in order of appearance
    pub fn field_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_field_names(&mut names);
        names
    }

    fn collect_field_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Node::Field(field) => names.push(field.name.as_str()),
            Node::Binary { left, right, .. } => {
                left.collect_field_names(names);
                right.collect_field_names(names);
            },
            Node::Concat(parts) => parts.iter().for_each(|p| p.collect_field_names(names)),
            _ => {},
        }
    }

    fn visit(&self, f: &mut impl FnMut(&Node)) {
        f(self);
        match self {
            Node::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            },
            Node::Concat(parts) => parts.iter().for_each(|p| p.visit(f)),
            _ => {},
        }
    }

    fn visit_mut(
        &mut self,
        f: &mut impl FnMut(&mut Node) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        f(self)?;
        match self {
            Node::Binary { left, right, .. } => {
                left.visit_mut(f)?;
                right.visit_mut(f)?;
            },
            Node::Concat(parts) => {
                for part in parts {
                    part.visit_mut(f)?;
                }
            },
            _ => {},
        }
        Ok(())
    }

    pub fn registers(&self) -> Option<&Registers> {
        match self {
            Node::Number { registers, .. }
            | Node::Utf8(registers)
            | Node::HexString(registers)
            | Node::Identifier { registers, .. }
            | Node::Enum { registers, .. }
            | Node::Bitset { registers, .. } => Some(registers),
            _ => None,
        }
    }

    /// Result type; unbound field references yield an error
    pub fn return_type(&self) -> Result<ReturnType, CompileError> {
        Ok(match self {
            Node::Long(_) => ReturnType::Long,
            Node::Double { .. } => ReturnType::Double,
            Node::Binary { op, left, right } => {
                let left_type = left.return_type()?;
                let right_type = right.return_type()?;
                let both_long = left_type == ReturnType::Long && right_type == ReturnType::Long;
                match op {
                    BinaryOp::Divide => ReturnType::Double,
                    BinaryOp::Power
                        if both_long && right.sign_guarantee() == SignGuarantee::Positive =>
                    {
                        ReturnType::Long
                    },
                    BinaryOp::Power => ReturnType::Double,
                    _ if both_long => ReturnType::Long,
                    _ => ReturnType::Double,
                }
            },
            Node::Number { kind, .. } => kind.return_type(),
            Node::Field(field) => {
                field
                    .binding
                    .ok_or_else(|| CompileError::UnknownField(field.name.clone()))?
                    .return_type
            },
            Node::Str(_)
            | Node::Concat(_)
            | Node::Utf8(_)
            | Node::HexString(_)
            | Node::Identifier { .. }
            | Node::Enum { .. } => ReturnType::String,
            Node::Bitset { .. } => ReturnType::StringList,
        })
    }

    /// Sign known at compile time; only constants carry one
    pub fn sign_guarantee(&self) -> SignGuarantee {
        use SignGuarantee::*;
        match self {
            Node::Long(v) if *v >= 0 => Positive,
            Node::Long(_) => Negative,
            Node::Double { value, .. } if *value >= 0.0 => Positive,
            Node::Double { .. } => Negative,
            Node::Binary { op, left, right } => {
                let (l, r) = (left.sign_guarantee(), right.sign_guarantee());
                match (op, l, r) {
                    (_, Unknown, _) => Unknown,
                    (BinaryOp::Power, Positive, Positive | Negative) => Positive,
                    (BinaryOp::Power, _, _) => Unknown,
                    (_, _, Unknown) => Unknown,
                    (BinaryOp::Add, Positive, Positive) => Positive,
                    (BinaryOp::Add, Negative, Negative) => Negative,
                    (BinaryOp::Add, _, _) => Unknown,
                    (BinaryOp::Subtract, Positive, Negative) => Positive,
                    (BinaryOp::Subtract, Negative, Positive) => Negative,
                    (BinaryOp::Subtract, _, _) => Unknown,
                    (BinaryOp::Multiply | BinaryOp::Divide, a, b) if a == b => Positive,
                    (BinaryOp::Multiply | BinaryOp::Divide, _, _) => Negative,
                }
            },
            _ => Unknown,
        }
    }

    fn check(&self) -> Result<(), CompileError> {
        match self {
            Node::Binary { op, left, right } => {
                for side in [left, right] {
                    let side_type = side.return_type()?;
                    if !side_type.is_numeric() {
                        return Err(CompileError::type_mismatch(
                            format!("a number for '{}'", op.symbol()),
                            format!("{} from {}", side_type, side),
                        ));
                    }
                }
                Ok(())
            },
            Node::Number {
                kind,
                registers,
                not_implemented,
            } => {
                registers.check()?;
                expect_register_count(kind.name(), registers, kind.register_count())?;
                not_implemented.check(kind.register_count())
            },
            Node::Concat(parts) => {
                if parts.is_empty() {
                    return Err(CompileError::invalid("concat needs at least one argument"));
                }
                for part in parts {
                    let part_type = part.return_type()?;
                    if part_type == ReturnType::StringList {
                        return Err(CompileError::type_mismatch(
                            "a string or number in concat",
                            format!("{} from {}", part_type, part),
                        ));
                    }
                }
                Ok(())
            },
            Node::Utf8(registers) | Node::HexString(registers) => registers.check(),
            Node::Identifier {
                kind,
                registers,
                not_implemented,
            } => {
                registers.check()?;
                match kind {
                    IdentifierKind::Eui48 if !matches!(registers.count(), 3 | 4) => {
                        return Err(CompileError::register_count(format!(
                            "eui48 needs 3 or 4 registers (got {})",
                            registers.count()
                        )))
                    },
                    IdentifierKind::Eui48 => {},
                    IdentifierKind::Ipv4 => expect_register_count(kind.name(), registers, 2)?,
                    IdentifierKind::Ipv6 => expect_register_count(kind.name(), registers, 8)?,
                }
                not_implemented.check(registers.count())
            },
            Node::Enum {
                registers,
                not_implemented,
                ..
            } => {
                registers.check()?;
                expect_register_range("enum", registers, 1, 4)?;
                not_implemented.check(registers.count())
            },
            Node::Bitset {
                registers,
                not_implemented,
                mapping,
            } => {
                registers.check()?;
                expect_register_range("bitset", registers, 1, 4)?;
                let bits = (registers.count() * 16) as u32;
                if let Some((bit, _)) = mapping.iter().find(|(bit, _)| *bit >= bits) {
                    return Err(CompileError::invalid(format!(
                        "Bit {} does not exist in {} registers",
                        bit,
                        registers.count()
                    )));
                }
                not_implemented.check(registers.count())
            },
            _ => Ok(()),
        }
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, nested: bool) -> fmt::Result {
        match self {
            Node::Long(v) => write!(f, "{}", v),
            Node::Double { text, .. } => f.write_str(text),
            Node::Binary { op, left, right } => {
                if nested {
                    f.write_str("(")?;
                }
                left.fmt_nested(f, true)?;
                write!(f, "{}", op.symbol())?;
                right.fmt_nested(f, true)?;
                if nested {
                    f.write_str(")")?;
                }
                Ok(())
            },
            Node::Number {
                kind,
                registers,
                not_implemented,
            } => write!(f, "{}({}{})", kind.name(), registers, not_implemented),
            Node::Field(field) => f.write_str(&field.name),
            Node::Str(s) => write!(f, "'{}'", s),
            Node::Concat(parts) => {
                f.write_str("concat(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    part.fmt_nested(f, false)?;
                }
                f.write_str(")")
            },
            Node::Utf8(registers) => write!(f, "utf8({})", registers),
            Node::HexString(registers) => write!(f, "hexstring({})", registers),
            Node::Identifier {
                kind,
                registers,
                not_implemented,
            } => write!(f, "{}({}{})", kind.name(), registers, not_implemented),
            Node::Enum {
                registers,
                not_implemented,
                mapping,
            } => {
                write!(f, "enum({}{}", registers, not_implemented)?;
                for (key, label) in mapping {
                    write!(f, " ; {}->'{}'", key, label)?;
                }
                f.write_str(")")
            },
            Node::Bitset {
                registers,
                not_implemented,
                mapping,
            } => {
                write!(f, "bitset({}{}", registers, not_implemented)?;
                for (bit, label) in mapping {
                    write!(f, " ; {}->'{}'", bit, label)?;
                }
                f.write_str(")")
            },
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_nested(f, false)
    }
}

fn expect_register_count(
    name: &str,
    registers: &Registers,
    expected: usize,
) -> Result<(), CompileError> {
    if registers.count() != expected {
        return Err(CompileError::register_count(format!(
            "{} needs exactly {} register{} (got {})",
            name,
            expected,
            if expected == 1 { "" } else { "s" },
            registers.count()
        )));
    }
    Ok(())
}

fn expect_register_range(
    name: &str,
    registers: &Registers,
    min: usize,
    max: usize,
) -> Result<(), CompileError> {
    if registers.count() < min || registers.count() > max {
        return Err(CompileError::register_count(format!(
            "{} needs {} to {} registers (got {})",
            name,
            min,
            max,
            registers.count()
        )));
    }
    Ok(())
}

// ============================================================================
// Schema context
// ============================================================================

/// Resolves field names while binding an expression
pub trait SchemaContext {
    fn resolve_field(&self, name: &str) -> Option<FieldBinding>;
}

impl<S: BuildHasher> SchemaContext for HashMap<String, FieldBinding, S> {
    fn resolve_field(&self, name: &str) -> Option<FieldBinding> {
        self.get(name).copied()
    }
}

/// Context without any fields
pub struct NoFields;

impl SchemaContext for NoFields {
    fn resolve_field(&self, _name: &str) -> Option<FieldBinding> {
        None
    }
}

// ============================================================================
// Expression
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Node,
    return_type: ReturnType,
    registers: Vec<Address>,
    fields: Vec<usize>,
}

impl Expression {
    /// Parse and bind in one step
    pub fn compile(text: &str, context: &dyn SchemaContext) -> Result<Self, CompileError> {
        Self::bind(parser::parse(text)?, context)
    }

    /// Resolve field references and validate a parsed tree
    pub fn bind(mut root: Node, context: &dyn SchemaContext) -> Result<Self, CompileError> {
        root.visit_mut(&mut |node: &mut Node| {
            if let Node::Field(field) = node {
                field.binding = Some(
                    context
                        .resolve_field(&field.name)
                        .ok_or_else(|| CompileError::UnknownField(field.name.clone()))?,
                );
            }
            Ok(())
        })?;
        root.visit_mut(&mut |node: &mut Node| node.check())?;

        let mut registers = BTreeSet::new();
        let mut fields = BTreeSet::new();
        root.visit(&mut |node: &Node| {
            if let Some(r) = node.registers() {
                registers.extend(r.addresses().iter().copied());
            }
            if let Node::Field(FieldRef {
                binding: Some(binding),
                ..
            }) = node
            {
                fields.insert(binding.index);
            }
        });

        Ok(Self {
            return_type: root.return_type()?,
            root,
            registers: registers.into_iter().collect(),
            fields: fields.into_iter().collect(),
        })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn return_type(&self) -> ReturnType {
        self.return_type
    }

    /// Sorted, without duplicates
    pub fn required_registers(&self) -> &[Address] {
        &self.registers
    }

    /// Sorted field table indices
    pub fn required_fields(&self) -> &[usize] {
        &self.fields
    }

    pub fn address_classes(&self) -> BTreeSet<AddressClass> {
        self.registers.iter().map(|a| a.class).collect()
    }

    /// First register and the size of the block from first to last register
    pub fn register_span(&self) -> Option<(Address, usize)> {
        let first = *self.registers.first()?;
        let last = *self.registers.last()?;
        Some((first, usize::from(last.physical.saturating_sub(first.physical)) + 1))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}
