use std::fmt;
use std::time::Duration;

use super::error::{ParseError, Position};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    Number(f64),
    Duration(Duration),
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    /// `=`
    Eq,
    /// `!=`
    Neq,
    /// `=~`
    Re,
    /// `!~`
    Nre,
    /// `|=`
    PipeExact,
    /// `|~`
    PipeMatch,
    Pipe,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    /// `==`
    CmpEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "identifier {name:?}"),
            Self::Str(value) => write!(f, "string {value:?}"),
            Self::Number(value) => write!(f, "number {value}"),
            Self::Duration(value) => write!(f, "duration {value:?}"),
            Self::LBrace => f.write_str("'{'"),
            Self::RBrace => f.write_str("'}'"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
            Self::LBracket => f.write_str("'['"),
            Self::RBracket => f.write_str("']'"),
            Self::Comma => f.write_str("','"),
            Self::Eq => f.write_str("'='"),
            Self::Neq => f.write_str("'!='"),
            Self::Re => f.write_str("'=~'"),
            Self::Nre => f.write_str("'!~'"),
            Self::PipeExact => f.write_str("'|='"),
            Self::PipeMatch => f.write_str("'|~'"),
            Self::Pipe => f.write_str("'|'"),
            Self::Add => f.write_str("'+'"),
            Self::Sub => f.write_str("'-'"),
            Self::Mul => f.write_str("'*'"),
            Self::Div => f.write_str("'/'"),
            Self::Mod => f.write_str("'%'"),
            Self::Pow => f.write_str("'^'"),
            Self::CmpEq => f.write_str("'=='"),
            Self::Gt => f.write_str("'>'"),
            Self::Gte => f.write_str("'>='"),
            Self::Lt => f.write_str("'<'"),
            Self::Lte => f.write_str("'<='"),
            Self::Eof => f.write_str("end of query"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Position,
}

/// Split a query into tokens. The result always ends with [`TokenKind::Eof`].
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer {
        src: input,
        pos: Position {
            line: 1,
            column: 1,
            offset: 0,
        },
    };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer<'a> {
    src: &'a str,
    pos: Position,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

// Dots are accepted here and validated by the parser, which knows whether
// dotted label names are allowed.
fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

impl Lexer<'_> {
    fn rest(&self) -> &str {
        &self.src[self.pos.offset..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.rest().chars().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos.offset += c.len_utf8();
        if c == '\n' {
            self.pos.line += 1;
            self.pos.column = 1;
        } else {
            self.pos.column += 1;
        }
        Some(c)
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, ParseError> {
        self.skip_whitespace_and_comments();
        let start = self.pos;
        let token = |kind: TokenKind| -> Result<Token, ParseError> {
            Ok(Token { kind, pos: start })
        };

        let Some(c) = self.peek() else {
            return token(TokenKind::Eof);
        };

        if is_ident_start(c) {
            return token(TokenKind::Ident(self.ident()));
        }
        let leading_dot = c == '.' && self.peek_second().is_some_and(|d| d.is_ascii_digit());
        if c.is_ascii_digit() || leading_dot {
            return self.number_or_duration(start);
        }
        if c == '"' {
            return token(TokenKind::Str(self.quoted_string(start)?));
        }
        if c == '`' {
            return token(TokenKind::Str(self.raw_string(start)?));
        }

        self.bump();
        let next = self.peek();
        let mut two = |kind: TokenKind| -> Result<Token, ParseError> {
            self.bump();
            Ok(Token { kind, pos: start })
        };
        match (c, next) {
            ('=', Some('~')) => two(TokenKind::Re),
            ('=', Some('=')) => two(TokenKind::CmpEq),
            ('!', Some('=')) => two(TokenKind::Neq),
            ('!', Some('~')) => two(TokenKind::Nre),
            ('|', Some('=')) => two(TokenKind::PipeExact),
            ('|', Some('~')) => two(TokenKind::PipeMatch),
            ('>', Some('=')) => two(TokenKind::Gte),
            ('<', Some('=')) => two(TokenKind::Lte),
            ('=', _) => token(TokenKind::Eq),
            ('|', _) => token(TokenKind::Pipe),
            ('>', _) => token(TokenKind::Gt),
            ('<', _) => token(TokenKind::Lt),
            ('{', _) => token(TokenKind::LBrace),
            ('}', _) => token(TokenKind::RBrace),
            ('(', _) => token(TokenKind::LParen),
            (')', _) => token(TokenKind::RParen),
            ('[', _) => token(TokenKind::LBracket),
            (']', _) => token(TokenKind::RBracket),
            (',', _) => token(TokenKind::Comma),
            ('+', _) => token(TokenKind::Add),
            ('-', _) => token(TokenKind::Sub),
            ('*', _) => token(TokenKind::Mul),
            ('/', _) => token(TokenKind::Div),
            ('%', _) => token(TokenKind::Mod),
            ('^', _) => token(TokenKind::Pow),
            (c, _) => Err(ParseError::new(start, format!("unexpected character {c:?}"))),
        }
    }

    fn ident(&mut self) -> String {
        let begin = self.pos.offset;
        while self.peek().is_some_and(is_ident_continue) {
            self.bump();
        }
        self.src[begin..self.pos.offset].to_string()
    }

    fn digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
    }

    fn number_or_duration(&mut self, start: Position) -> Result<Token, ParseError> {
        let begin = self.pos.offset;
        self.digits();

        if self.peek().is_some_and(|c| c.is_alphabetic() && c != 'e' && c != 'E') {
            self.pos = start;
            let duration = self.duration(start)?;
            return Ok(Token {
                kind: TokenKind::Duration(duration),
                pos: start,
            });
        }

        if self.peek() == Some('.') {
            self.bump();
            self.digits();
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            self.digits();
        }
        if self.peek().is_some_and(is_ident_continue) {
            return Err(ParseError::new(start, "malformed number"));
        }

        let text = &self.src[begin..self.pos.offset];
        let value = text
            .parse::<f64>()
            .map_err(|e| ParseError::new(start, format!("invalid number {text:?}: {e}")))?;
        Ok(Token {
            kind: TokenKind::Number(value),
            pos: start,
        })
    }

    /// Parse a duration such as `5m`, `250ms` or `1h30m`.
    fn duration(&mut self, start: Position) -> Result<Duration, ParseError> {
        let mut total = Duration::ZERO;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            let begin = self.pos.offset;
            self.digits();
            let amount: u64 = self.src[begin..self.pos.offset]
                .parse()
                .map_err(|_| ParseError::new(start, "duration out of range"))?;

            let unit = self.duration_unit(start)?;
            let part = amount
                .checked_mul(unit)
                .map(Duration::from_nanos)
                .ok_or_else(|| ParseError::new(start, "duration out of range"))?;
            total = total
                .checked_add(part)
                .ok_or_else(|| ParseError::new(start, "duration out of range"))?;
        }
        if self.peek().is_some_and(is_ident_continue) {
            return Err(ParseError::new(start, "malformed duration"));
        }
        Ok(total)
    }

    /// Consume a duration unit and return its length in nanoseconds.
    fn duration_unit(&mut self, start: Position) -> Result<u64, ParseError> {
        const UNITS: [(&str, u64); 10] = [
            ("ns", 1),
            ("us", 1_000),
            ("µs", 1_000),
            ("ms", 1_000_000),
            ("s", 1_000_000_000),
            ("m", 60 * 1_000_000_000),
            ("h", 3_600 * 1_000_000_000),
            ("d", 86_400 * 1_000_000_000),
            ("w", 7 * 86_400 * 1_000_000_000),
            ("y", 365 * 86_400 * 1_000_000_000),
        ];
        for (suffix, nanos) in UNITS {
            if self.rest().starts_with(suffix) {
                for _ in suffix.chars() {
                    self.bump();
                }
                return Ok(nanos);
            }
        }
        Err(ParseError::new(start, "unknown duration unit"))
    }

    fn quoted_string(&mut self, start: Position) -> Result<String, ParseError> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(ParseError::new(start, "unterminated string")),
                Some('"') => return Ok(value),
                Some('\\') => {
                    let escape_pos = self.pos;
                    let c = match self.bump() {
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some('\'') => '\'',
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some(c) => {
                            return Err(ParseError::new(
                                escape_pos,
                                format!("unknown escape sequence '\\{c}'"),
                            ));
                        }
                        None => return Err(ParseError::new(start, "unterminated string")),
                    };
                    value.push(c);
                }
                Some(c) => value.push(c),
            }
        }
    }

    fn raw_string(&mut self, start: Position) -> Result<String, ParseError> {
        self.bump();
        let begin = self.pos.offset;
        loop {
            match self.peek() {
                None => return Err(ParseError::new(start, "unterminated raw string")),
                Some('`') => {
                    let value = self.src[begin..self.pos.offset].to_string();
                    self.bump();
                    return Ok(value);
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn test_selector_tokens() {
        assert_eq!(
            kinds(r#"{app="api", env!~`dev|test`}"#),
            vec![
                TokenKind::LBrace,
                TokenKind::Ident("app".into()),
                TokenKind::Eq,
                TokenKind::Str("api".into()),
                TokenKind::Comma,
                TokenKind::Ident("env".into()),
                TokenKind::Nre,
                TokenKind::Str("dev|test".into()),
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_pipeline_operators() {
        assert_eq!(
            kinds(r#"|= "a" |~ "b" != "c" | status >= 500"#),
            vec![
                TokenKind::PipeExact,
                TokenKind::Str("a".into()),
                TokenKind::PipeMatch,
                TokenKind::Str("b".into()),
                TokenKind::Neq,
                TokenKind::Str("c".into()),
                TokenKind::Pipe,
                TokenKind::Ident("status".into()),
                TokenKind::Gte,
                TokenKind::Number(500.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers_and_durations() {
        assert_eq!(
            kinds("2.5 1e3 .5 [5m] [1h30m] [250ms]"),
            vec![
                TokenKind::Number(2.5),
                TokenKind::Number(1000.0),
                TokenKind::Number(0.5),
                TokenKind::LBracket,
                TokenKind::Duration(Duration::from_secs(300)),
                TokenKind::RBracket,
                TokenKind::LBracket,
                TokenKind::Duration(Duration::from_secs(5400)),
                TokenKind::RBracket,
                TokenKind::LBracket,
                TokenKind::Duration(Duration::from_millis(250)),
                TokenKind::RBracket,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""say \"hi\"\n""#),
            vec![TokenKind::Str("say \"hi\"\n".into()), TokenKind::Eof]
        );
        assert_eq!(
            kinds(r"`\d+`"),
            vec![TokenKind::Str(r"\d+".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("1 # one\n+ 2"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Add,
                TokenKind::Number(2.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("1 +\n  foo").unwrap();
        assert_eq!(
            tokens[2].pos,
            Position {
                line: 2,
                column: 3,
                offset: 6
            }
        );
    }

    #[test]
    fn test_errors_carry_position() {
        let err = tokenize("{app=\"api").unwrap_err();
        assert_eq!(err.pos.column, 6);
        assert_eq!(err.to_string(), "1:6: unterminated string");

        let err = tokenize("1 @ 2").unwrap_err();
        assert_eq!(err.pos.column, 3);

        assert!(tokenize("[5x]").is_err());
        assert!(tokenize(r#""\d""#).is_err());
    }
}
