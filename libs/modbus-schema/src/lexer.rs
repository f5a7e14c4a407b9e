//! Tokenizer for field expressions

use crate::error::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Decimal digits with an optional fraction: `12`, `12.5`
    Number(String),
    /// A digit, an `x` and hex digits: `0xDEAD`, `4x00124`
    HexOrAddress(String),
    /// `label:digits`, e.g. `hr:00012`
    Address(String),
    /// Function or field name
    Word(String),
    /// `'text'`
    Str(String),
    /// `"0x12 0x34"`
    Raw(String),
    LParen,
    RParen,
    Comma,
    Semicolon,
    Hash,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    DotDot,
    Arrow,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            Self::Number(t) | Self::HexOrAddress(t) | Self::Address(t) | Self::Word(t) => {
                format!("\"{}\"", t)
            },
            Self::Str(t) => format!("'{}'", t),
            Self::Raw(t) => format!("\"{}\"", t),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Semicolon => "';'".to_string(),
            Self::Hash => "'#'".to_string(),
            Self::Plus => "'+'".to_string(),
            Self::Minus => "'-'".to_string(),
            Self::Star => "'*'".to_string(),
            Self::Slash => "'/'".to_string(),
            Self::Caret => "'^'".to_string(),
            Self::DotDot => "'..'".to_string(),
            Self::Arrow => "'->'".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Character offset in the expression text
    pub position: usize,
}

pub fn tokenize(text: &str) -> Result<Vec<Token>, CompileError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        if c.is_whitespace() {
            pos += 1;
            continue;
        }
        let start = pos;
        let kind = match c {
            '(' => single(&mut pos, TokenKind::LParen),
            ')' => single(&mut pos, TokenKind::RParen),
            ',' => single(&mut pos, TokenKind::Comma),
            ';' => single(&mut pos, TokenKind::Semicolon),
            '#' => single(&mut pos, TokenKind::Hash),
            '+' => single(&mut pos, TokenKind::Plus),
            '*' => single(&mut pos, TokenKind::Star),
            '/' => single(&mut pos, TokenKind::Slash),
            '^' => single(&mut pos, TokenKind::Caret),
            '-' if chars.get(pos + 1) == Some(&'>') => {
                pos += 2;
                TokenKind::Arrow
            },
            '-' => single(&mut pos, TokenKind::Minus),
            '.' if chars.get(pos + 1) == Some(&'.') => {
                pos += 2;
                TokenKind::DotDot
            },
            '\'' | '"' => {
                let end = chars[pos + 1..]
                    .iter()
                    .position(|ch| *ch == c)
                    .map(|offset| pos + 1 + offset)
                    .ok_or_else(|| CompileError::syntax(start, "Unterminated quoted text"))?;
                let content: String = chars[pos + 1..end].iter().collect();
                pos = end + 1;
                if c == '\'' {
                    TokenKind::Str(content)
                } else {
                    TokenKind::Raw(content)
                }
            },
            c if c.is_ascii_digit() => lex_number(&chars, &mut pos),
            c if c.is_ascii_alphabetic() || c == '_' => lex_word(&chars, &mut pos),
            other => {
                return Err(CompileError::syntax(
                    start,
                    format!("Unexpected character '{}'", other),
                ))
            },
        };
        tokens.push(Token {
            kind,
            position: start,
        });
    }
    Ok(tokens)
}

fn single(pos: &mut usize, kind: TokenKind) -> TokenKind {
    *pos += 1;
    kind
}

fn take_while(chars: &[char], pos: &mut usize, pred: impl Fn(char) -> bool) -> String {
    let start = *pos;
    while *pos < chars.len() && pred(chars[*pos]) {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

fn lex_number(chars: &[char], pos: &mut usize) -> TokenKind {
    let start = *pos;
    // `0xDEAD` or `4x00124`
    if matches!(chars.get(start + 1), Some('x') | Some('X'))
        && chars.get(start + 2).is_some_and(|c| c.is_ascii_hexdigit())
    {
        *pos += 2;
        let digits = take_while(chars, pos, |c| c.is_ascii_hexdigit());
        return TokenKind::HexOrAddress(format!("{}x{}", chars[start], digits));
    }
    let mut text = take_while(chars, pos, |c| c.is_ascii_digit());
    if chars.get(*pos) == Some(&'.') && chars.get(*pos + 1).is_some_and(|c| c.is_ascii_digit()) {
        *pos += 1;
        text.push('.');
        text.push_str(&take_while(chars, pos, |c| c.is_ascii_digit()));
    }
    TokenKind::Number(text)
}

fn lex_word(chars: &[char], pos: &mut usize) -> TokenKind {
    // An address label may contain '-' (`holding-register:12`), a field name may not
    let label_end = {
        let mut end = *pos;
        while end < chars.len()
            && (chars[end].is_ascii_alphabetic() || chars[end] == '-' || chars[end] == '_')
        {
            end += 1;
        }
        end
    };
    if chars.get(label_end) == Some(&':') {
        let mut digits_end = label_end + 1;
        while digits_end < chars.len() && chars[digits_end].is_whitespace() {
            digits_end += 1;
        }
        let digits_start = digits_end;
        while digits_end < chars.len() && chars[digits_end].is_ascii_digit() {
            digits_end += 1;
        }
        if digits_end > digits_start {
            let label: String = chars[*pos..label_end].iter().collect();
            let digits: String = chars[digits_start..digits_end].iter().collect();
            *pos = digits_end;
            return TokenKind::Address(format!("{}:{}", label, digits));
        }
    }
    TokenKind::Word(take_while(chars, pos, |c| {
        c.is_ascii_alphanumeric() || c == '_'
    }))
}
