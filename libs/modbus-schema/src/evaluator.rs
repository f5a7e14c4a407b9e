//! Expression evaluation against register values and other field values
//!
//! Evaluation yields `Ok(None)` when the device legitimately has no value
//! (a "not implemented" pattern, a non-finite intermediate in integer math or an
//! absent upstream field) and an error when the inputs are unusable.

use crate::address::Address;
use crate::codec;
use crate::error::DecodeError;
use crate::expression::{BinaryOp, Expression, IdentifierKind, Node, NumberKind, Registers};
use crate::register::RegisterSource;
use crate::value::{double_to_string, ReturnType, Value};

/// Lookup of already evaluated field values by field index
pub trait FieldValues {
    fn field_value(&self, index: usize) -> Option<&Value>;
}

impl FieldValues for Vec<Option<Value>> {
    fn field_value(&self, index: usize) -> Option<&Value> {
        self.get(index).and_then(Option::as_ref)
    }
}

/// For expressions without field references
pub struct NoFieldValues;

impl FieldValues for NoFieldValues {
    fn field_value(&self, _index: usize) -> Option<&Value> {
        None
    }
}

type Eval<T> = Result<Option<T>, DecodeError>;

/// Intermediate numeric result; integers carry extra headroom until narrowed
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i128),
    Float(f64),
}

impl Num {
    fn to_f64(self) -> f64 {
        match self {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        }
    }
}

/// Evaluate a compiled expression
pub fn evaluate(
    expression: &Expression,
    registers: &dyn RegisterSource,
    fields: &dyn FieldValues,
) -> Result<Option<Value>, DecodeError> {
    let evaluator = Evaluator { registers, fields };
    evaluator.value(expression.root(), expression.return_type())
}

struct Evaluator<'a> {
    registers: &'a dyn RegisterSource,
    fields: &'a dyn FieldValues,
}

impl Evaluator<'_> {
    fn value(&self, node: &Node, return_type: ReturnType) -> Eval<Value> {
        match return_type {
            ReturnType::Long => match self.number(node)? {
                Some(Num::Int(v)) => narrow(v).map(Some),
                Some(Num::Float(v)) if v.is_finite() => narrow(v as i128).map(Some),
                _ => Ok(None),
            },
            ReturnType::Double => Ok(self.number(node)?.map(|n| Value::Double(n.to_f64()))),
            ReturnType::String => Ok(self.string(node)?.map(Value::String)),
            ReturnType::StringList => self.string_list(node),
        }
    }

    fn field(&self, node: &Node) -> Option<&Value> {
        match node {
            Node::Field(field) => field
                .binding
                .and_then(|binding| self.fields.field_value(binding.index)),
            _ => None,
        }
    }

    /// Register values in expression order, after swaps
    fn raw(&self, registers: &Registers) -> Result<Vec<u16>, DecodeError> {
        match registers {
            Registers::Addresses(list) => list.iter().map(|a| self.register(*a)).collect(),
            Registers::Constant(values) => Ok(values.clone()),
            Registers::SwapEndian(inner) => {
                Ok(self.raw(inner)?.into_iter().map(codec::swap_endian).collect())
            },
            Registers::SwapBytes(inner) => {
                Ok(self.raw(inner)?.into_iter().map(codec::swap_bytes).collect())
            },
        }
    }

    fn register(&self, address: Address) -> Result<u16, DecodeError> {
        let value = self
            .registers
            .register(address)
            .ok_or_else(|| DecodeError::missing_register(address.to_string()))?;
        if value.is_read_error() {
            return Err(DecodeError::read_error(address.to_string()));
        }
        value
            .value
            .ok_or_else(|| DecodeError::missing_register(address.to_string()))
    }

    // ========================================================================
    // Numbers
    // ========================================================================

    fn number(&self, node: &Node) -> Eval<Num> {
        match node {
            Node::Long(v) => Ok(Some(Num::Int(i128::from(*v)))),
            Node::Double { value, .. } => Ok(Some(Num::Float(*value))),
            Node::Binary { op, left, right } => {
                let (Some(l), Some(r)) = (self.number(left)?, self.number(right)?) else {
                    return Ok(None);
                };
                let is_long = node.return_type().ok() == Some(ReturnType::Long);
                match (is_long, l, r) {
                    (true, Num::Int(l), Num::Int(r)) => integer_op(*op, l, r),
                    _ => Ok(Some(Num::Float(float_op(*op, l.to_f64(), r.to_f64())))),
                }
            },
            Node::Number {
                kind,
                registers,
                not_implemented,
            } => {
                let raw = self.raw(registers)?;
                if not_implemented.matches(&raw) {
                    return Ok(None);
                }
                let num = match kind {
                    NumberKind::Int16 => Num::Int(i128::from(codec::decode_int16(&raw)?)),
                    NumberKind::UInt16 => Num::Int(i128::from(codec::decode_uint16(&raw)?)),
                    NumberKind::Int32 => Num::Int(i128::from(codec::decode_int32(&raw)?)),
                    NumberKind::UInt32 => Num::Int(i128::from(codec::decode_uint32(&raw)?)),
                    NumberKind::Int64 => Num::Int(i128::from(codec::decode_int64(&raw)?)),
                    NumberKind::UInt64 => Num::Int(i128::from(codec::decode_uint64(&raw)?)),
                    NumberKind::Ieee754_32 => Num::Float(codec::decode_ieee754_32(&raw)?),
                    NumberKind::Ieee754_64 => Num::Float(codec::decode_ieee754_64(&raw)?),
                };
                Ok(Some(num))
            },
            Node::Field(_) => Ok(match self.field(node) {
                Some(Value::Long(v)) => Some(Num::Int(i128::from(*v))),
                Some(Value::UnsignedLong(v)) => Some(Num::Int(i128::from(*v))),
                Some(Value::Double(v)) => Some(Num::Float(*v)),
                _ => None,
            }),
            other => Err(DecodeError::out_of_domain(format!(
                "{} does not produce a number",
                other
            ))),
        }
    }

    // ========================================================================
    // Strings
    // ========================================================================

    fn string(&self, node: &Node) -> Eval<String> {
        match node {
            Node::Str(s) => Ok(Some(s.clone())),
            Node::Concat(parts) => {
                let mut result = String::new();
                for part in parts {
                    let text = if part.return_type().is_ok_and(ReturnType::is_numeric) {
                        self.number(part)?.map(|n| match n {
                            Num::Int(v) => v.to_string(),
                            Num::Float(v) => double_to_string(v),
                        })
                    } else {
                        self.string(part)?
                    };
                    match text {
                        Some(text) => result.push_str(&text),
                        None => return Ok(None),
                    }
                }
                Ok(Some(result))
            },
            Node::Utf8(registers) => Ok(Some(codec::decode_utf8(&self.raw(registers)?)?)),
            Node::HexString(registers) => Ok(Some(codec::hex_string(&codec::registers_to_bytes(
                &self.raw(registers)?,
            )))),
            Node::Identifier {
                kind,
                registers,
                not_implemented,
            } => {
                let raw = self.raw(registers)?;
                if not_implemented.matches(&raw) {
                    return Ok(None);
                }
                let text = match kind {
                    IdentifierKind::Eui48 => codec::decode_eui48(&raw)?,
                    IdentifierKind::Ipv4 => codec::decode_ipv4(&raw)?,
                    IdentifierKind::Ipv6 => codec::decode_ipv6(&raw)?,
                };
                Ok(Some(text))
            },
            Node::Enum {
                registers,
                not_implemented,
                mapping,
            } => {
                let raw = self.raw(registers)?;
                if not_implemented.matches(&raw) {
                    return Ok(None);
                }
                let key = codec::decode_enum_key(&raw)?;
                Ok(Some(
                    mapping
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, label)| label.clone())
                        .unwrap_or_else(|| {
                            format!(
                                "No mapping for value {}",
                                codec::hex_string(&codec::registers_to_bytes(&raw))
                            )
                        }),
                ))
            },
            Node::Field(_) => Ok(self.field(node).and_then(Value::as_string)),
            other => Err(DecodeError::out_of_domain(format!(
                "{} does not produce a string",
                other
            ))),
        }
    }

    fn string_list(&self, node: &Node) -> Eval<Value> {
        match node {
            Node::Bitset {
                registers,
                not_implemented,
                mapping,
            } => {
                let raw = self.raw(registers)?;
                if not_implemented.matches(&raw) {
                    return Ok(None);
                }
                let names = codec::decode_bitset(&raw, |bit| {
                    mapping
                        .iter()
                        .find(|(b, _)| *b == bit)
                        .map(|(_, label)| label.clone())
                });
                Ok(Some(Value::StringList(names)))
            },
            Node::Field(_) => Ok(self.field(node).cloned()),
            other => Err(DecodeError::out_of_domain(format!(
                "{} does not produce a list",
                other
            ))),
        }
    }
}

fn integer_op(op: BinaryOp, l: i128, r: i128) -> Eval<Num> {
    let overflow = || DecodeError::out_of_domain(format!("{} {} {} overflows", l, op.symbol(), r));
    let result = match op {
        BinaryOp::Add => l.checked_add(r).ok_or_else(overflow)?,
        BinaryOp::Subtract => l.checked_sub(r).ok_or_else(overflow)?,
        BinaryOp::Multiply => l.checked_mul(r).ok_or_else(overflow)?,
        BinaryOp::Divide | BinaryOp::Power => {
            let value = float_op(op, l as f64, r as f64);
            if !value.is_finite() {
                return Ok(None);
            }
            value as i128
        },
    };
    Ok(Some(Num::Int(result)))
}

fn float_op(op: BinaryOp, l: f64, r: f64) -> f64 {
    match op {
        BinaryOp::Add => l + r,
        BinaryOp::Subtract => l - r,
        BinaryOp::Multiply => l * r,
        BinaryOp::Divide => l / r,
        BinaryOp::Power => l.powf(r),
    }
}

/// Fit an integer into a `Value`, preferring the signed form
fn narrow(value: i128) -> Result<Value, DecodeError> {
    if let Ok(v) = i64::try_from(value) {
        return Ok(Value::Long(v));
    }
    u64::try_from(value)
        .map(Value::UnsignedLong)
        .map_err(|_| DecodeError::out_of_domain(format!("{} does not fit in 64 bits", value)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::address::AddressClass;
    use crate::expression::{FieldBinding, NoFields};
    use crate::register::{ReadErrorKind, RegisterBlock, RegisterStore, FIXTURE_TIMESTAMP};
    use std::collections::HashMap;

    fn store(words: &[u16]) -> RegisterStore {
        let mut store = RegisterStore::new();
        store.load(&RegisterBlock::from_values(
            Address::new(AddressClass::HoldingRegister, 0),
            words,
            FIXTURE_TIMESTAMP,
        )
        .unwrap());
        store
    }

    fn eval(text: &str, registers: &RegisterStore) -> Result<Option<Value>, DecodeError> {
        let expr = Expression::compile(text, &NoFields).unwrap();
        evaluate(&expr, registers, &NoFieldValues)
    }

    fn eval_const(text: &str) -> Option<Value> {
        eval(text, &RegisterStore::new()).unwrap()
    }

    #[test]
    fn test_constant_arithmetic() {
        assert_eq!(eval_const("1+2*3"), Some(Value::Long(7)));
        assert_eq!(eval_const("7 + (-5(-10 - 1))^3"), Some(Value::Long(166382)));
        assert_eq!(eval_const("4/2"), Some(Value::Double(2.0)));
        assert_eq!(eval_const("2^10"), Some(Value::Long(1024)));
        assert_eq!(eval_const("2^-1"), Some(Value::Double(0.5)));
        assert_eq!(eval_const("-2^2"), Some(Value::Long(4)));
        assert_eq!(eval_const("2^3^2"), Some(Value::Long(512)));
        assert_eq!(eval_const("5 (1.5)"), Some(Value::Double(7.5)));
    }

    #[test]
    fn test_long_arithmetic_limits() {
        assert_eq!(
            eval_const("9223372036854775807 + 1"),
            Some(Value::UnsignedLong(9223372036854775808))
        );
        assert!(matches!(
            eval("9223372036854775807 * 9223372036854775807", &RegisterStore::new()),
            Err(DecodeError::OutOfDomain(_))
        ));
        assert_eq!(eval_const("10^400"), None);
    }

    #[test]
    fn test_numeric_registers() {
        let regs = store(&[0x3039, 0xB669, 0xFD2E, 0xEEDD, 0xEF0B, 0x8216, 0x7EEB]);
        assert_eq!(eval("int16(hr:0)", &regs).unwrap(), Some(Value::Long(12345)));
        assert_eq!(
            eval("int32(hr:1#2)", &regs).unwrap(),
            Some(Value::Long(-1234567890))
        );
        assert_eq!(
            eval("uint64(hr:3#4)", &regs).unwrap(),
            Some(Value::UnsignedLong(17212176183586094827))
        );
        assert_eq!(
            eval("int64(hr:3#4)", &regs).unwrap(),
            Some(Value::Long(-1234567890123456789))
        );
        assert_eq!(
            eval("int16(hr:0) * 2", &regs).unwrap(),
            Some(Value::Long(24690))
        );
        assert_eq!(
            eval("int16(hr:0) / 10", &regs).unwrap(),
            Some(Value::Double(1234.5))
        );
        assert_eq!(
            eval("int16(swapbytes(hr:0))", &regs).unwrap(),
            Some(Value::Long(0x3930))
        );
    }

    #[test]
    fn test_not_implemented() {
        let regs = store(&[0xFFFF, 0x8000]);
        assert_eq!(eval("int16(hr:0 ; 0xFFFF)", &regs).unwrap(), None);
        assert_eq!(eval("int16(hr:1 ; 0xFFFF)", &regs).unwrap(), Some(Value::Long(-32768)));
        assert_eq!(eval("int16(hr:0 ; 0xFFFF) * 2", &regs).unwrap(), None);
        assert_eq!(
            eval("concat('x', int16(hr:0 ; 0xFFFF))", &regs).unwrap(),
            None
        );
    }

    #[test]
    fn test_register_problems() {
        let mut regs = store(&[0x0001]);
        assert!(matches!(
            eval("int16(hr:5)", &regs),
            Err(DecodeError::MissingRegister(_))
        ));
        regs.block_mut(AddressClass::HoldingRegister).set_read_error(
            0,
            ReadErrorKind::Soft,
            FIXTURE_TIMESTAMP,
        );
        assert!(matches!(
            eval("int16(hr:0)", &regs),
            Err(DecodeError::ReadError(_))
        ));
    }

    #[test]
    fn test_strings() {
        let regs = store(&[0x4e69, 0x656c, 0x7320, 0x4261, 0x736a, 0x6573, 0x0102, 0x0304]);
        assert_eq!(
            eval("utf8(hr:0#6)", &regs).unwrap(),
            Some(Value::String("Niels Basjes".into()))
        );
        assert_eq!(
            eval("hexstring(hr:6#2)", &regs).unwrap(),
            Some(Value::String("0x01 0x02 0x03 0x04".into()))
        );
        assert_eq!(
            eval("ipv4addr(hr:6#2)", &regs).unwrap(),
            Some(Value::String("1.2.3.4".into()))
        );
        assert_eq!(
            eval("concat('v', 1, '/', 2.5, '/', 4/2)", &regs).unwrap(),
            Some(Value::String("v1/2.5/2.0".into()))
        );
    }

    #[test]
    fn test_enum_and_bitset() {
        let regs = store(&[0x0001, 0x0005, 0x100F]);
        assert_eq!(
            eval("enum(hr:0 ; 0->'Off' ; 1->'On')", &regs).unwrap(),
            Some(Value::String("On".into()))
        );
        assert_eq!(
            eval("enum(hr:1 ; 0->'Off' ; 1->'On')", &regs).unwrap(),
            Some(Value::String("No mapping for value 0x00 0x05".into()))
        );
        assert_eq!(
            eval("bitset(hr:2 ; 0->'Zero' ; 12->'Twelve')", &regs).unwrap(),
            Some(Value::StringList(vec![
                "Zero".into(),
                "Bit 1".into(),
                "Bit 2".into(),
                "Bit 3".into(),
                "Twelve".into(),
            ]))
        );
    }

    #[test]
    fn test_field_references() {
        let mut context = HashMap::new();
        context.insert(
            "Scale".to_string(),
            FieldBinding {
                index: 0,
                return_type: ReturnType::Long,
            },
        );
        context.insert(
            "Name".to_string(),
            FieldBinding {
                index: 1,
                return_type: ReturnType::String,
            },
        );
        let regs = store(&[0x0064]);
        let values = vec![Some(Value::Long(2)), Some(Value::String("Pump".into()))];

        let expr = Expression::compile("uint16(hr:0) * 10^Scale", &context).unwrap();
        assert_eq!(
            evaluate(&expr, &regs, &values).unwrap(),
            Some(Value::Double(10000.0))
        );

        let expr = Expression::compile("concat(Name, ' ', Scale)", &context).unwrap();
        assert_eq!(
            evaluate(&expr, &regs, &values).unwrap(),
            Some(Value::String("Pump 2".into()))
        );

        let absent: Vec<Option<Value>> = vec![None, None];
        let expr = Expression::compile("uint16(hr:0) * 10^Scale", &context).unwrap();
        assert_eq!(evaluate(&expr, &regs, &absent).unwrap(), None);
    }
}
