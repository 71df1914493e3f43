use super::InterpreterError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    Number(f64),
    /// A template literal. `substitutions` counts `${...}` holes; `cooked`
    /// holds only the text between them.
    Template {
        cooked: String,
        substitutions: usize,
    },
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
    /// A line terminator appeared between this token and the previous one.
    pub newline_before: bool,
}

// Longest first so `===` wins over `==` and `=`.
const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "**", "<<", ">>", "(", ")", "[", "]", "{", "}", ",", ":", ";", ".", "?", "=",
    "+", "-", "*", "/", "%", "!", "~", "<", ">", "&", "|", "^", "@", "#",
];

const MAX_TEMPLATE_DEPTH: usize = 32;

pub fn tokenize(source: &str) -> Result<Vec<Token>, InterpreterError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    newline_pending: bool,
    template_depth: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            newline_pending: false,
            template_depth: 0,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, InterpreterError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let offset = self.pos;
            let newline_before = std::mem::take(&mut self.newline_pending);
            let Some(ch) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    offset,
                    newline_before: true,
                });
                return Ok(tokens);
            };
            let kind = if ch == '"' || ch == '\'' {
                self.string(ch)?
            } else if ch == '`' {
                self.template()?
            } else if ch.is_ascii_digit()
                || (ch == '.' && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()))
            {
                self.number()?
            } else if is_ident_start(ch) {
                self.ident()
            } else {
                self.punct()?
            };
            tokens.push(Token {
                kind,
                offset,
                newline_before,
            });
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> InterpreterError {
        InterpreterError::Parse {
            offset,
            message: message.into(),
        }
    }

    fn skip_trivia(&mut self) -> Result<(), InterpreterError> {
        loop {
            match self.peek() {
                Some('\n') | Some('\r') | Some('\u{2028}') | Some('\u{2029}') => {
                    self.newline_pending = true;
                    self.bump();
                }
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' || c == '\r' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let start = self.pos;
                    self.pos += 2;
                    let Some(end) = self.rest().find("*/") else {
                        return Err(self.error(start, "unterminated block comment"));
                    };
                    if self.rest()[..end].contains(['\n', '\r']) {
                        self.newline_pending = true;
                    }
                    self.pos += end + 2;
                }
                _ => return Ok(()),
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<TokenKind, InterpreterError> {
        let start = self.pos;
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') | Some('\r') => {
                    return Err(self.error(start, "unterminated string literal"))
                }
                Some(c) if c == quote => return Ok(TokenKind::Str(out)),
                Some('\\') => self.escape(&mut out, start)?,
                Some(c) => out.push(c),
            }
        }
    }

    fn template(&mut self) -> Result<TokenKind, InterpreterError> {
        let start = self.pos;
        if self.template_depth >= MAX_TEMPLATE_DEPTH {
            return Err(self.error(start, "template literals nested too deep"));
        }
        self.template_depth += 1;
        let kind = self.template_body(start);
        self.template_depth -= 1;
        kind
    }

    fn template_body(&mut self, start: usize) -> Result<TokenKind, InterpreterError> {
        self.bump();
        let mut cooked = String::new();
        let mut substitutions = 0;
        loop {
            match self.bump() {
                None => return Err(self.error(start, "unterminated template literal")),
                Some('`') => {
                    return Ok(TokenKind::Template {
                        cooked,
                        substitutions,
                    })
                }
                Some('\\') => self.escape(&mut cooked, start)?,
                Some('$') if self.peek() == Some('{') => {
                    self.bump();
                    substitutions += 1;
                    self.skip_substitution(start)?;
                }
                Some(c) => cooked.push(c),
            }
        }
    }

    /// Skips a `${ ... }` body up to its matching brace. The body is never
    /// evaluated; the parser rejects any template that has one.
    fn skip_substitution(&mut self, start: usize) -> Result<(), InterpreterError> {
        let mut depth = 1usize;
        while let Some(c) = self.bump() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                '"' | '\'' => {
                    self.pos -= 1;
                    self.string(c)?;
                }
                '`' => {
                    self.pos -= 1;
                    self.template()?;
                }
                _ => {}
            }
        }
        Err(self.error(start, "unterminated template substitution"))
    }

    fn escape(&mut self, out: &mut String, start: usize) -> Result<(), InterpreterError> {
        let Some(c) = self.bump() else {
            return Err(self.error(start, "unterminated escape sequence"));
        };
        match c {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{0008}'),
            'f' => out.push('\u{000C}'),
            'v' => out.push('\u{000B}'),
            '0' if !self.peek().is_some_and(|c| c.is_ascii_digit()) => out.push('\0'),
            'x' => {
                let code = self.hex_digits(2, start)?;
                out.push(char::from_u32(code).ok_or_else(|| self.error(start, "bad \\x escape"))?);
            }
            'u' => {
                let code = if self.peek() == Some('{') {
                    self.bump();
                    let digits_start = self.pos;
                    while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                        self.bump();
                    }
                    let digits = &self.src[digits_start..self.pos];
                    if self.bump() != Some('}') || digits.is_empty() {
                        return Err(self.error(start, "bad \\u{...} escape"));
                    }
                    u32::from_str_radix(digits, 16)
                        .map_err(|_| self.error(start, "bad \\u{...} escape"))?
                } else {
                    self.hex_digits(4, start)?
                };
                out.push(
                    char::from_u32(code).ok_or_else(|| self.error(start, "invalid code point"))?,
                );
            }
            '\r' => {
                if self.peek() == Some('\n') {
                    self.bump();
                }
            }
            '\n' => {}
            c if c.is_ascii_digit() => {
                return Err(self.error(start, "octal escapes are not supported"));
            }
            other => out.push(other),
        }
        Ok(())
    }

    fn hex_digits(&mut self, count: usize, start: usize) -> Result<u32, InterpreterError> {
        let mut value = 0u32;
        for _ in 0..count {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error(start, "bad hex escape"))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    fn number(&mut self) -> Result<TokenKind, InterpreterError> {
        let start = self.pos;
        let radix = match (self.peek(), self.peek_at(1)) {
            (Some('0'), Some('x' | 'X')) => Some(16),
            (Some('0'), Some('o' | 'O')) => Some(8),
            (Some('0'), Some('b' | 'B')) => Some(2),
            _ => None,
        };
        if let Some(radix) = radix {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().is_some_and(|c| c.is_digit(radix) || c == '_') {
                self.bump();
            }
            let digits = self.src[digits_start..self.pos].replace('_', "");
            let value = u64::from_str_radix(&digits, radix)
                .map_err(|_| self.error(start, "malformed numeric literal"))?;
            self.reject_ident_tail(start)?;
            return Ok(TokenKind::Number(value as f64));
        }

        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.bump();
        }
        if self.peek() == Some('.') {
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error(start, "malformed exponent"));
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        if self.peek() == Some('n') {
            return Err(self.error(start, "BigInt literals are not supported"));
        }
        self.reject_ident_tail(start)?;
        let text = self.src[start..self.pos].replace('_', "");
        let value = text
            .parse::<f64>()
            .map_err(|_| self.error(start, "malformed numeric literal"))?;
        Ok(TokenKind::Number(value))
    }

    fn reject_ident_tail(&self, start: usize) -> Result<(), InterpreterError> {
        if self.peek().is_some_and(is_ident_start) {
            return Err(self.error(start, "identifier directly after numeric literal"));
        }
        Ok(())
    }

    fn ident(&mut self) -> TokenKind {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_part) {
            self.bump();
        }
        TokenKind::Ident(self.src[start..self.pos].to_string())
    }

    fn punct(&mut self) -> Result<TokenKind, InterpreterError> {
        let rest = self.rest();
        for p in PUNCTUATORS {
            if rest.starts_with(p) {
                self.pos += p.len();
                return Ok(TokenKind::Punct(p));
            }
        }
        let ch = self.peek().unwrap_or_default();
        Err(self.error(self.pos, format!("unexpected character `{ch}`")))
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_part(c: char) -> bool {
    is_ident_start(c) || c.is_alphanumeric() || c == '\u{200C}' || c == '\u{200D}'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src)
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lexes_call_with_strings_numbers_and_punctuation() {
        assert_eq!(
            kinds(r#"callTool('read', {"n": -1.5e2, ok: true})"#),
            vec![
                TokenKind::Ident("callTool".into()),
                TokenKind::Punct("("),
                TokenKind::Str("read".into()),
                TokenKind::Punct(","),
                TokenKind::Punct("{"),
                TokenKind::Str("n".into()),
                TokenKind::Punct(":"),
                TokenKind::Punct("-"),
                TokenKind::Number(150.0),
                TokenKind::Punct(","),
                TokenKind::Ident("ok".into()),
                TokenKind::Punct(":"),
                TokenKind::Ident("true".into()),
                TokenKind::Punct("}"),
                TokenKind::Punct(")"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn decodes_escapes_and_tracks_newlines() {
        let tokens = tokenize("'a\\n\\u0041\\x42'\n// note\nfoo /* x\n */ bar").expect("tokenize");
        assert_eq!(tokens[0].kind, TokenKind::Str("a\nAB".into()));
        assert!(tokens[1].newline_before);
        assert!(tokens[2].newline_before);
        assert_eq!(tokens[2].kind, TokenKind::Ident("bar".into()));
    }

    #[test]
    fn template_substitutions_are_counted_not_evaluated() {
        assert_eq!(
            kinds("`a${ {b: `c`} }d`"),
            vec![
                TokenKind::Template {
                    cooked: "ad".into(),
                    substitutions: 1
                },
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn nested_template_substitutions_are_bounded() {
        let src = format!("{}{}", "`${".repeat(10_000), "}`".repeat(10_000));
        let err = tokenize(&src).unwrap_err();
        assert!(err.to_string().contains("nested too deep"), "{err}");
        assert!(tokenize("`${ `${ `x` }` }`").is_ok());
    }

    #[test]
    fn rejects_unterminated_and_unknown_input() {
        assert!(tokenize("'open").is_err());
        assert!(tokenize("`open").is_err());
        assert!(tokenize("/* open").is_err());
        assert!(tokenize("12abc").is_err());
        assert!(tokenize("10n").is_err());
        assert!(tokenize("a \\ b").is_err());
    }

    #[test]
    fn longest_punctuator_wins() {
        assert_eq!(
            kinds("a => ...b === c"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Punct("=>"),
                TokenKind::Punct("..."),
                TokenKind::Ident("b".into()),
                TokenKind::Punct("==="),
                TokenKind::Ident("c".into()),
                TokenKind::Eof,
            ]
        );
    }
}
