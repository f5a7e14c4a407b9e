//! Decoded field values

use std::fmt;

/// Tolerance used when comparing expected and decoded floating point values
pub const DOUBLE_TOLERANCE: f64 = 0.001;

/// The type an expression produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnType {
    Long,
    Double,
    String,
    StringList,
}

impl ReturnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Long | Self::Double)
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Long => "LONG",
            Self::Double => "DOUBLE",
            Self::String => "STRING",
            Self::StringList => "STRINGLIST",
        })
    }
}

/// A decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Long(i64),
    /// Unsigned 64-bit values above `i64::MAX` keep their full magnitude
    UnsignedLong(u64),
    Double(f64),
    String(String),
    StringList(Vec<String>),
}

impl Value {
    pub fn return_type(&self) -> ReturnType {
        match self {
            Self::Long(_) | Self::UnsignedLong(_) => ReturnType::Long,
            Self::Double(_) => ReturnType::Double,
            Self::String(_) => ReturnType::String,
            Self::StringList(_) => ReturnType::StringList,
        }
    }

    /// Integer value; absent when it does not fit an `i64`
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            Self::UnsignedLong(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_unsigned_long(&self) -> Option<u64> {
        match self {
            Self::Long(v) => u64::try_from(*v).ok(),
            Self::UnsignedLong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Long(v) => Some(*v as f64),
            Self::UnsignedLong(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Textual form; numbers are formatted, lists are not converted
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::Long(v) => Some(v.to_string()),
            Self::UnsignedLong(v) => Some(v.to_string()),
            Self::Double(v) => Some(double_to_string(*v)),
            Self::String(s) => Some(s.clone()),
            Self::StringList(_) => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(list) => Some(list),
            _ => None,
        }
    }

    /// Strings used to compare this value against scenario expectations
    pub fn to_compare_strings(&self) -> Vec<String> {
        match self {
            Self::Long(v) => vec![v.to_string()],
            Self::UnsignedLong(v) => vec![v.to_string()],
            Self::Double(v) => vec![format_double(*v)],
            Self::String(s) => vec![s.clone()],
            Self::StringList(list) => list.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(v) => write!(f, "{}", v),
            Self::UnsignedLong(v) => write!(f, "{}", v),
            Self::Double(v) => f.write_str(&format_double(*v)),
            Self::String(s) => f.write_str(s),
            Self::StringList(list) => write!(f, "[{}]", list.join(", ")),
        }
    }
}

/// Three decimals, with fixed names for the special values
pub fn format_double(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Infinite".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinite".to_string()
    } else {
        format!("{:.3}", value)
    }
}

/// Shortest form that still reads as a floating point number (`5.0`, `0.25`)
pub fn double_to_string(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

/// Compare expected and actual strings, using a tolerance for doubles
pub fn values_match(return_type: ReturnType, expected: &[String], actual: &[String]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    expected.iter().zip(actual).all(|(e, a)| {
        if e.trim() == a.trim() {
            return true;
        }
        if return_type != ReturnType::Double {
            return false;
        }
        match (e.trim().parse::<f64>(), a.trim().parse::<f64>()) {
            (Ok(e), Ok(a)) if e.is_finite() && a.is_finite() => (e - a).abs() <= DOUBLE_TOLERANCE,
            _ => false,
        }
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_strings() {
        assert_eq!(Value::Long(-12345).to_compare_strings(), vec!["-12345"]);
        assert_eq!(
            Value::UnsignedLong(17212176183586094827).to_compare_strings(),
            vec!["17212176183586094827"]
        );
        assert_eq!(Value::Double(1234.5678).to_compare_strings(), vec!["1234.568"]);
        assert_eq!(Value::Double(f64::NAN).to_compare_strings(), vec!["NaN"]);
        assert_eq!(Value::Double(f64::INFINITY).to_compare_strings(), vec!["+Infinite"]);
        assert_eq!(
            Value::Double(f64::NEG_INFINITY).to_compare_strings(),
            vec!["-Infinite"]
        );
        let list = vec!["A".to_string(), "B".to_string()];
        assert_eq!(Value::StringList(list.clone()).to_compare_strings(), list);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::UnsignedLong(u64::MAX).as_long(), None);
        assert_eq!(Value::UnsignedLong(5).as_long(), Some(5));
        assert_eq!(Value::Long(-1).as_unsigned_long(), None);
        assert_eq!(Value::Long(3).as_double(), Some(3.0));
        assert_eq!(Value::Double(2.0).as_string().as_deref(), Some("2.0"));
        assert_eq!(Value::Double(0.25).as_string().as_deref(), Some("0.25"));
        assert_eq!(Value::String("x".into()).as_double(), None);
        assert!(Value::StringList(vec![]).as_string().is_none());
        assert_eq!(Value::Long(1).return_type(), ReturnType::Long);
        assert_eq!(Value::UnsignedLong(1).return_type(), ReturnType::Long);
    }

    #[test]
    fn test_values_match_with_tolerance() {
        let e = |s: &str| vec![s.to_string()];
        assert!(values_match(ReturnType::Double, &e("1234.567"), &e("1234.567")));
        assert!(values_match(ReturnType::Double, &e("1234.5670"), &e("1234.567")));
        assert!(values_match(ReturnType::Double, &e("24691.349"), &e("24691.3495")));
        assert!(!values_match(ReturnType::Double, &e("1234.56"), &e("1234.567")));
        assert!(values_match(ReturnType::Double, &e("NaN"), &e("NaN")));
        assert!(!values_match(ReturnType::Long, &e("10"), &e("10.0")));
        assert!(!values_match(ReturnType::StringList, &e("A"), &[]));
        assert!(values_match(ReturnType::StringList, &[], &[]));
    }
}
