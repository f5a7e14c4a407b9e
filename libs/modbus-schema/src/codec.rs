//! Conversions from raw 16-bit registers to values
//!
//! Registers are big-endian and the first register is the most significant one.

use crate::error::DecodeError;

pub const BYTES_PER_REGISTER: usize = 2;

pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Pair up bytes into registers; a trailing odd byte is an error
pub fn bytes_to_registers(bytes: &[u8]) -> Result<Vec<u16>, DecodeError> {
    if bytes.len() % BYTES_PER_REGISTER != 0 {
        return Err(DecodeError::out_of_domain(format!(
            "{} bytes cannot be split into 16-bit registers",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(BYTES_PER_REGISTER)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn expect_len(registers: &[u16], expected: usize) -> Result<(), DecodeError> {
    if registers.len() != expected {
        return Err(DecodeError::insufficient(expected, registers.len()));
    }
    Ok(())
}

fn to_u64(registers: &[u16]) -> u64 {
    registers
        .iter()
        .fold(0u64, |acc, r| (acc << 16) | u64::from(*r))
}

// ============================================================================
// Numbers
// ============================================================================

pub fn decode_int16(registers: &[u16]) -> Result<i64, DecodeError> {
    expect_len(registers, 1)?;
    Ok(i64::from(registers[0] as i16))
}

pub fn decode_uint16(registers: &[u16]) -> Result<i64, DecodeError> {
    expect_len(registers, 1)?;
    Ok(i64::from(registers[0]))
}

pub fn decode_int32(registers: &[u16]) -> Result<i64, DecodeError> {
    expect_len(registers, 2)?;
    Ok(i64::from(to_u64(registers) as u32 as i32))
}

pub fn decode_uint32(registers: &[u16]) -> Result<i64, DecodeError> {
    expect_len(registers, 2)?;
    Ok(to_u64(registers) as i64)
}

pub fn decode_int64(registers: &[u16]) -> Result<i64, DecodeError> {
    expect_len(registers, 4)?;
    Ok(to_u64(registers) as i64)
}

pub fn decode_uint64(registers: &[u16]) -> Result<u64, DecodeError> {
    expect_len(registers, 4)?;
    Ok(to_u64(registers))
}

pub fn decode_ieee754_32(registers: &[u16]) -> Result<f64, DecodeError> {
    expect_len(registers, 2)?;
    Ok(f64::from(f32::from_bits(to_u64(registers) as u32)))
}

pub fn decode_ieee754_64(registers: &[u16]) -> Result<f64, DecodeError> {
    expect_len(registers, 4)?;
    Ok(f64::from_bits(to_u64(registers)))
}

// ============================================================================
// Register transformations
// ============================================================================

/// Reverse all 16 bits of a register (`ABCD` becomes `B3D5`)
pub fn swap_endian(register: u16) -> u16 {
    register.reverse_bits()
}

/// Swap the two bytes of a register (`ABCD` becomes `CDAB`)
pub fn swap_bytes(register: u16) -> u16 {
    register.swap_bytes()
}

// ============================================================================
// Strings
// ============================================================================

/// `0x61 0x62 0x63`
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("0x{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse `0x61 0x62`, `0x6162` or `6162` into bytes
pub fn parse_hex_bytes(text: &str) -> Option<Vec<u8>> {
    let digits: String = text
        .split_whitespace()
        .map(|word| {
            word.strip_prefix("0x")
                .or_else(|| word.strip_prefix("0X"))
                .unwrap_or(word)
        })
        .collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
        })
        .collect()
}

/// UTF-8 text, terminated by the first 0x00 byte
pub fn decode_utf8(registers: &[u16]) -> Result<String, DecodeError> {
    let bytes = registers_to_bytes(registers);
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec()).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
}

/// `01:02:03:04:05:06`; with 4 registers the last 3 are used
pub fn decode_eui48(registers: &[u16]) -> Result<String, DecodeError> {
    let used = match registers.len() {
        3 => registers,
        4 => &registers[1..],
        n => return Err(DecodeError::insufficient(3, n)),
    };
    Ok(registers_to_bytes(used)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

/// `192.168.1.2`
pub fn decode_ipv4(registers: &[u16]) -> Result<String, DecodeError> {
    expect_len(registers, 2)?;
    Ok(registers_to_bytes(registers)
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join("."))
}

/// Eight groups of four uppercase hex digits
pub fn decode_ipv6(registers: &[u16]) -> Result<String, DecodeError> {
    expect_len(registers, 8)?;
    Ok(registers
        .iter()
        .map(|r| format!("{:04X}", r))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Key used for enum lookup: signed 16/32/64 bits, 48 bits unsigned for 3 registers
pub fn decode_enum_key(registers: &[u16]) -> Result<i64, DecodeError> {
    match registers.len() {
        1 => decode_int16(registers),
        2 => decode_int32(registers),
        3 => Ok(to_u64(registers) as i64),
        4 => decode_int64(registers),
        n => Err(DecodeError::out_of_domain(format!(
            "enum needs 1 to 4 registers, got {}",
            n
        ))),
    }
}

/// Labels of all set bits in ascending bit order
///
/// Bit 0 is the least significant bit of the last register. Bits without a
/// name are rendered as `Bit N`.
pub fn decode_bitset(registers: &[u16], name_of: impl Fn(u32) -> Option<String>) -> Vec<String> {
    let total_bits = (registers.len() * 16) as u32;
    (0..total_bits)
        .filter(|bit| {
            let index = registers.len() - 1 - (*bit / 16) as usize;
            registers[index] & (1 << (bit % 16)) != 0
        })
        .map(|bit| name_of(bit).unwrap_or_else(|| format!("Bit {}", bit)))
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_integers() {
        assert_eq!(decode_int16(&[0x3039]).unwrap(), 12345);
        assert_eq!(decode_int16(&[0xCFC7]).unwrap(), -12345);
        assert_eq!(decode_uint16(&[0xD431]).unwrap(), 54321);
        assert_eq!(decode_int32(&[0xB669, 0xFD2E]).unwrap(), -1234567890);
        assert_eq!(decode_uint32(&[0xB669, 0xFD2E]).unwrap(), 3060399406);
        assert_eq!(
            decode_int64(&[0xEEDD, 0xEF0B, 0x8216, 0x7EEB]).unwrap(),
            -1234567890123456789
        );
        assert_eq!(
            decode_uint64(&[0xEEDD, 0xEF0B, 0x8216, 0x7EEB]).unwrap(),
            17212176183586094827
        );
        assert_eq!(
            decode_int64(&[0x1122, 0x10F4, 0x7DE9, 0x8115]).unwrap(),
            1234567890123456789
        );
    }

    #[test]
    fn test_wrong_register_count() {
        assert_eq!(
            decode_int32(&[0x0001]),
            Err(DecodeError::InsufficientRegisters {
                expected: 2,
                actual: 1
            })
        );
        assert!(decode_ipv6(&[0; 7]).is_err());
        assert!(decode_eui48(&[0; 2]).is_err());
    }

    #[test]
    fn test_floats() {
        let f32_value = decode_ieee754_32(&[0x449A, 0x5225]).unwrap();
        assert!((f32_value - 1234.567).abs() < 0.001);
        let f64_value = decode_ieee754_64(&[0x4093, 0x4A45, 0x84FC, 0xD47C]).unwrap();
        assert!((f64_value - 1234.56789012).abs() < 1e-6);
    }

    #[test]
    fn test_swaps() {
        assert_eq!(swap_endian(0xABCD), 0xB3D5);
        assert_eq!(swap_bytes(0xABCD), 0xCDAB);
        assert_eq!(swap_endian(0x8000), 0x0001);
    }

    #[test]
    fn test_strings() {
        let niels = [0x4e69, 0x656c, 0x7320, 0x4261, 0x736a, 0x6573];
        assert_eq!(decode_utf8(&niels).unwrap(), "Niels Basjes");
        assert_eq!(decode_utf8(&[0x4142, 0x0043]).unwrap(), "AB");
        assert!(decode_utf8(&[0xFFFE]).is_err());
        assert_eq!(hex_string(&[0x61, 0x62]), "0x61 0x62");
        assert_eq!(decode_eui48(&[0x0102, 0x0304, 0x0506]).unwrap(), "01:02:03:04:05:06");
        assert_eq!(
            decode_eui48(&[0xFFFF, 0x0102, 0x0304, 0x0506]).unwrap(),
            "01:02:03:04:05:06"
        );
        assert_eq!(decode_ipv4(&[0x0102, 0x0304]).unwrap(), "1.2.3.4");
        assert_eq!(
            decode_ipv6(&[0x0001, 0x0203, 0x0405, 0x0607, 0x0809, 0x0A0B, 0x0C0D, 0x0E0F])
                .unwrap(),
            "0001:0203:0405:0607:0809:0A0B:0C0D:0E0F"
        );
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("0xDE 0xAD"), Some(vec![0xDE, 0xAD]));
        assert_eq!(parse_hex_bytes("0xDEAD 0xBEEF"), Some(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(parse_hex_bytes("dead"), Some(vec![0xDE, 0xAD]));
        assert_eq!(parse_hex_bytes("0xDEA"), None);
        assert_eq!(parse_hex_bytes("0xZZ"), None);
    }

    #[test]
    fn test_enum_keys() {
        assert_eq!(decode_enum_key(&[0xFFFF]).unwrap(), -1);
        assert_eq!(decode_enum_key(&[0x0000, 0x0004]).unwrap(), 4);
        assert_eq!(decode_enum_key(&[0x0001, 0x0000, 0x0000]).unwrap(), 1 << 32);
        assert!(decode_enum_key(&[0; 5]).is_err());
    }

    #[test]
    fn test_bitset_partial_names() {
        // Bits 0, 1, 2, 3 and 12 over 32 bits
        let registers = [0x0000, 0x100F];
        let names = |bit: u32| match bit {
            0 => Some("Zero".to_string()),
            1 => Some("One".to_string()),
            2 => Some("Two".to_string()),
            _ => None,
        };
        assert_eq!(
            decode_bitset(&registers, names),
            vec!["Zero", "One", "Two", "Bit 3", "Bit 12"]
        );
        assert!(decode_bitset(&[0, 0], |_| None).is_empty());
        assert_eq!(decode_bitset(&[0x8000, 0x0000], |_| None), vec!["Bit 31"]);
    }
}
