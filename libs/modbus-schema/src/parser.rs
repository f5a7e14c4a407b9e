//! Recursive descent parser for field expressions
//!
//! ```text
//! expression := term (('+' | '-') term)*
//! term       := power (('*' | '/') power | '(' power)*
//! power      := unary ('^' power)?
//! unary      := '-' NUMBER | primary
//! primary    := NUMBER | STRING | '(' expression ')' | NAME | NAME '(' arguments ')'
//! registers  := '"' hex '"' | swapendian '(' registers ')' | swapbytes '(' registers ')'
//!             | address ('#' count | '..' address | (',' address)*)
//! ```
//!
//! A parenthesised expression directly after a term multiplies: `5 (3.3)` is `5*3.3`.

use crate::address::{Address, MODBUS_MAX_REGISTERS_PER_REQUEST};
use crate::codec;
use crate::error::CompileError;
use crate::expression::{
    BinaryOp, FieldRef, IdentifierKind, Node, NotImplemented, NumberKind, Registers,
};
use crate::lexer::{tokenize, Token, TokenKind};

/// Parse expression text into an unbound tree
pub fn parse(text: &str) -> Result<Node, CompileError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(CompileError::syntax(0, "Empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: text.chars().count(),
    };
    let node = parser.expression()?;
    match parser.peek() {
        Some(token) => Err(CompileError::syntax(
            token.position,
            format!("Unexpected {}", token.kind.describe()),
        )),
        None => Ok(node),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn peek_kind_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn position(&self) -> usize {
        self.peek().map_or(self.end, |t| t.position)
    }

    fn next(&mut self) -> Result<Token, CompileError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| CompileError::syntax(self.end, "Unexpected end of expression"))?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(&self, token: &Token, wanted: &str) -> CompileError {
        CompileError::syntax(
            token.position,
            format!("Expected {} but found {}", wanted, token.kind.describe()),
        )
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), CompileError> {
        let token = self.next()?;
        if token.kind != kind {
            return Err(self.unexpected(&token, &kind.describe()));
        }
        Ok(())
    }

    // ========================================================================
    // Arithmetic
    // ========================================================================

    fn expression(&mut self) -> Result<Node, CompileError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Subtract,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.term()?;
            left = binary(op, left, right);
        }
    }

    fn term(&mut self) -> Result<Node, CompileError> {
        let mut left = self.power()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => {
                    self.pos += 1;
                    BinaryOp::Multiply
                },
                Some(TokenKind::Slash) => {
                    self.pos += 1;
                    BinaryOp::Divide
                },
                // Implicit multiplication, the '(' stays for the operand
                Some(TokenKind::LParen) => BinaryOp::Multiply,
                _ => return Ok(left),
            };
            let right = self.power()?;
            left = binary(op, left, right);
        }
    }

    fn power(&mut self) -> Result<Node, CompileError> {
        let base = self.unary()?;
        if self.peek_kind() == Some(&TokenKind::Caret) {
            self.pos += 1;
            let exponent = self.power()?;
            return Ok(binary(BinaryOp::Power, base, exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Node, CompileError> {
        if self.peek_kind() != Some(&TokenKind::Minus) {
            return self.primary();
        }
        let minus = self.next()?;
        let token = self.next()?;
        match token.kind {
            TokenKind::Number(text) => number_constant(&format!("-{}", text), minus.position),
            _ => Err(self.unexpected(&token, "a number after '-'")),
        }
    }

    fn primary(&mut self) -> Result<Node, CompileError> {
        let token = self.next()?;
        match token.kind {
            TokenKind::Number(text) => number_constant(&text, token.position),
            TokenKind::Str(text) => Ok(Node::Str(text)),
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            },
            TokenKind::Word(name) if self.peek_kind() == Some(&TokenKind::LParen) => {
                self.pos += 1;
                let node = self.function(&name, token.position)?;
                self.expect(TokenKind::RParen)?;
                Ok(node)
            },
            TokenKind::Word(name) => Ok(Node::Field(FieldRef {
                name,
                binding: None,
            })),
            _ => Err(self.unexpected(&token, "a value")),
        }
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// Arguments of `name(`; the closing ')' is left for the caller
    fn function(&mut self, name: &str, position: usize) -> Result<Node, CompileError> {
        if let Some(kind) = NumberKind::from_name(name) {
            let registers = self.registers()?;
            let not_implemented = self.not_implemented()?;
            return Ok(Node::Number {
                kind,
                registers,
                not_implemented,
            });
        }
        let identifier = match name {
            "eui48" => Some(IdentifierKind::Eui48),
            "ipv4addr" => Some(IdentifierKind::Ipv4),
            "ipv6addr" => Some(IdentifierKind::Ipv6),
            _ => None,
        };
        if let Some(kind) = identifier {
            let registers = self.registers()?;
            let not_implemented = self.not_implemented()?;
            return Ok(Node::Identifier {
                kind,
                registers,
                not_implemented,
            });
        }

        match name {
            "utf8" => Ok(Node::Utf8(self.registers()?)),
            "hexstring" => Ok(Node::HexString(self.registers()?)),
            "enum" => {
                let registers = self.registers()?;
                let not_implemented = self.not_implemented()?;
                let mapping = self.mapping(Some)?;
                Ok(Node::Enum {
                    registers,
                    not_implemented,
                    mapping,
                })
            },
            "bitset" => {
                let registers = self.registers()?;
                let not_implemented = self.not_implemented()?;
                let mapping = self.mapping(|key| u32::try_from(key).ok())?;
                Ok(Node::Bitset {
                    registers,
                    not_implemented,
                    mapping,
                })
            },
            "concat" => {
                let mut parts = vec![self.expression()?];
                while self.peek_kind() == Some(&TokenKind::Comma) {
                    self.pos += 1;
                    parts.push(self.expression()?);
                }
                Ok(Node::Concat(parts))
            },
            "swapendian" | "swapbytes" => Err(CompileError::syntax(
                position,
                format!("{} can only be applied to registers", name),
            )),
            _ => Err(CompileError::UnknownFunction(name.to_string())),
        }
    }

    // ========================================================================
    // Registers
    // ========================================================================

    fn registers(&mut self) -> Result<Registers, CompileError> {
        if let (Some(TokenKind::Word(word)), Some(TokenKind::LParen)) =
            (self.peek_kind(), self.peek_kind_at(1))
        {
            let swap_endian = match word.as_str() {
                "swapendian" => true,
                "swapbytes" => false,
                other => return Err(CompileError::UnknownFunction(other.to_string())),
            };
            self.pos += 2;
            let inner = Box::new(self.registers()?);
            self.expect(TokenKind::RParen)?;
            return Ok(if swap_endian {
                Registers::SwapEndian(inner)
            } else {
                Registers::SwapBytes(inner)
            });
        }

        if let Some(TokenKind::Raw(text)) = self.peek_kind() {
            let text = text.clone();
            self.pos += 1;
            let invalid = || CompileError::invalid(format!("Invalid register values \"{}\"", text));
            let bytes = codec::parse_hex_bytes(&text).ok_or_else(invalid)?;
            let values = codec::bytes_to_registers(&bytes).map_err(|_| invalid())?;
            return Ok(Registers::Constant(values));
        }

        let first = self.address()?;
        match self.peek_kind() {
            Some(TokenKind::Hash) => {
                self.pos += 1;
                let count = self.signed_integer()?;
                if count < 1 {
                    return Err(CompileError::register_count(format!(
                        "Register count must be at least 1 (got {})",
                        count
                    )));
                }
                if count > MODBUS_MAX_REGISTERS_PER_REQUEST as i64 {
                    return Err(CompileError::register_count(format!(
                        "Register count {} is more than the {} a single request can retrieve",
                        count, MODBUS_MAX_REGISTERS_PER_REQUEST
                    )));
                }
                range(first, count)
            },
            Some(TokenKind::DotDot) => {
                self.pos += 1;
                let last = self.address()?;
                if last.class != first.class || last < first {
                    return Err(CompileError::register_count(format!(
                        "The register range {} .. {} is not valid",
                        first, last
                    )));
                }
                range(first, i64::from(last.physical - first.physical) + 1)
            },
            _ => {
                let mut list = vec![first];
                while self.peek_kind() == Some(&TokenKind::Comma) {
                    self.pos += 1;
                    list.push(self.address()?);
                }
                Ok(Registers::Addresses(list))
            },
        }
    }

    fn address(&mut self) -> Result<Address, CompileError> {
        let token = self.next()?;
        match &token.kind {
            TokenKind::Address(text) | TokenKind::Number(text) | TokenKind::HexOrAddress(text) => {
                Address::parse(text)
            },
            _ => Err(self.unexpected(&token, "a register address")),
        }
    }

    fn signed_integer(&mut self) -> Result<i64, CompileError> {
        let negative = self.peek_kind() == Some(&TokenKind::Minus);
        if negative {
            self.pos += 1;
        }
        let token = self.next()?;
        let value = match &token.kind {
            TokenKind::Number(text) if !text.contains('.') => text
                .parse::<i64>()
                .map_err(|_| {
                    CompileError::syntax(token.position, format!("Number {} is too large", text))
                })?,
            _ => return Err(self.unexpected(&token, "an integer")),
        };
        Ok(if negative { -value } else { value })
    }

    /// `; 0xDEAD 0xBEEF` groups
    fn not_implemented(&mut self) -> Result<NotImplemented, CompileError> {
        let mut groups = Vec::new();
        while self.peek_kind() == Some(&TokenKind::Semicolon)
            && matches!(
                self.peek_kind_at(1),
                Some(TokenKind::HexOrAddress(t)) if t.starts_with("0x") || t.starts_with("0X")
            )
        {
            self.pos += 1;
            let position = self.position();
            let mut words = Vec::new();
            while let Some(TokenKind::HexOrAddress(text)) = self.peek_kind() {
                words.push(text.clone());
                self.pos += 1;
            }
            let text = words.join(" ");
            let invalid = || {
                CompileError::syntax(
                    position,
                    format!("Invalid not implemented value \"{}\"", text),
                )
            };
            let bytes = codec::parse_hex_bytes(&text).ok_or_else(invalid)?;
            groups.push(codec::bytes_to_registers(&bytes).map_err(|_| invalid())?);
        }
        Ok(NotImplemented(groups))
    }

    /// `; 1->'Label'` entries
    fn mapping<K: PartialEq + std::fmt::Display>(
        &mut self,
        convert: impl Fn(i64) -> Option<K>,
    ) -> Result<Vec<(K, String)>, CompileError> {
        let mut mapping: Vec<(K, String)> = Vec::new();
        while self.peek_kind() == Some(&TokenKind::Semicolon) {
            self.pos += 1;
            let position = self.position();
            let raw = self.signed_integer()?;
            let key = convert(raw).ok_or_else(|| {
                CompileError::syntax(position, format!("{} cannot be used as a key", raw))
            })?;
            self.expect(TokenKind::Arrow)?;
            let token = self.next()?;
            let label = match token.kind {
                TokenKind::Str(label) => label,
                _ => return Err(self.unexpected(&token, "a quoted label")),
            };
            if mapping.iter().any(|(existing, _)| *existing == key) {
                return Err(CompileError::invalid(format!("Duplicate mapping for {}", key)));
            }
            mapping.push((key, label));
        }
        Ok(mapping)
    }
}

fn binary(op: BinaryOp, left: Node, right: Node) -> Node {
    Node::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn number_constant(text: &str, position: usize) -> Result<Node, CompileError> {
    if text.contains('.') {
        let value = text
            .parse::<f64>()
            .map_err(|_| CompileError::syntax(position, format!("Invalid number {}", text)))?;
        return Ok(Node::Double {
            value,
            text: text.to_string(),
        });
    }
    text.parse::<i64>()
        .map(Node::Long)
        .map_err(|_| CompileError::syntax(position, format!("Number {} is too large", text)))
}

fn range(first: Address, count: i64) -> Result<Registers, CompileError> {
    (0..count)
        .map(|offset| {
            u16::try_from(offset)
                .ok()
                .and_then(|step| first.increment(step))
                .ok_or_else(|| {
                    CompileError::invalid_address(format!(
                        "{} registers starting at {} run past the last address",
                        count, first
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Registers::Addresses)
}
