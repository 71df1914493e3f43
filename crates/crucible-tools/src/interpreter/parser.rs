use super::ast::{Arg, ArrayItem, DeclKind, Expr, MemberProp, Program, PropKey, Property, Stmt};
use super::lexer::{tokenize, Token, TokenKind};
use super::InterpreterError;

const MAX_DEPTH: usize = 200;

const ASSIGN_OPS: &[&str] = &[
    "=", "+=", "-=", "*=", "/=", "%=", "**=", "<<=", ">>=", ">>>=", "&=", "|=", "^=", "&&=",
    "||=", "??=",
];

const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "if", "else", "for", "while", "do", "return", "switch", "case", "default", "try", "catch",
    "finally", "throw", "import", "export", "yield", "with", "debugger", "break", "continue",
];

pub fn parse_program(source: &str) -> Result<Program, InterpreterError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(Program { body })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_kind(&self, n: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + n).map(|t| &t.kind)
    }

    fn at_eof(&self) -> bool {
        matches!(self.current().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if !matches!(token.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        token
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Punct(q) if *q == p)
    }

    fn is_ident(&self, name: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Ident(n) if n == name)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), InterpreterError> {
        if self.eat_punct(p) {
            return Ok(());
        }
        Err(self.unexpected(&format!("expected `{p}`")))
    }

    fn error_at(&self, offset: usize, message: impl Into<String>) -> InterpreterError {
        InterpreterError::Parse {
            offset,
            message: message.into(),
        }
    }

    fn unexpected(&self, context: &str) -> InterpreterError {
        let token = self.current();
        let found = match &token.kind {
            TokenKind::Ident(name) => format!("`{name}`"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Number(_) => "number literal".to_string(),
            TokenKind::Template { .. } => "template literal".to_string(),
            TokenKind::Punct(p) => format!("`{p}`"),
            TokenKind::Eof => "end of input".to_string(),
        };
        self.error_at(token.offset, format!("{context}, found {found}"))
    }

    fn enter(&mut self) -> Result<(), InterpreterError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error_at(self.current().offset, "expression nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn leave_n(&mut self, levels: usize) {
        self.depth = self.depth.saturating_sub(levels);
    }

    fn statement(&mut self) -> Result<Stmt, InterpreterError> {
        if self.eat_punct(";") {
            return Ok(Stmt::Empty);
        }
        if self.is_punct("{") {
            self.enter()?;
            self.advance();
            let mut body = Vec::new();
            while !self.is_punct("}") {
                if self.at_eof() {
                    return Err(self.unexpected("expected `}`"));
                }
                body.push(self.statement()?);
            }
            self.advance();
            self.leave();
            return Ok(Stmt::Block(body));
        }
        if let TokenKind::Ident(name) = &self.current().kind {
            let kind = match name.as_str() {
                "const" => Some(DeclKind::Const),
                "let" => Some(DeclKind::Let),
                "var" => Some(DeclKind::Var),
                _ => None,
            };
            if let Some(kind) = kind {
                self.advance();
                let stmt = self.declaration(kind)?;
                self.terminator()?;
                return Ok(stmt);
            }
            if UNSUPPORTED_KEYWORDS.contains(&name.as_str()) {
                let name = name.clone();
                return Err(self.error_at(
                    self.current().offset,
                    format!("`{name}` statements are not supported"),
                ));
            }
        }
        let expr = self.expression()?;
        self.terminator()?;
        Ok(Stmt::Expr(expr))
    }

    fn declaration(&mut self, kind: DeclKind) -> Result<Stmt, InterpreterError> {
        let mut bindings = Vec::new();
        loop {
            let name = match &self.current().kind {
                TokenKind::Ident(name) => name.clone(),
                _ => return Err(self.unexpected("expected a binding name")),
            };
            self.advance();
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            bindings.push((name, init));
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(Stmt::Decl { kind, bindings })
    }

    /// Automatic semicolon insertion: a statement may end at `;`, before `}`,
    /// at end of input, or before a token on a new line.
    fn terminator(&mut self) -> Result<(), InterpreterError> {
        if self.eat_punct(";") {
            return Ok(());
        }
        if self.at_eof() || self.is_punct("}") || self.current().newline_before {
            return Ok(());
        }
        Err(self.unexpected("expected `;`"))
    }

    fn expression(&mut self) -> Result<Expr, InterpreterError> {
        let first = self.assignment()?;
        if !self.is_punct(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            items.push(self.assignment()?);
        }
        Ok(Expr::Sequence(items))
    }

    fn assignment(&mut self) -> Result<Expr, InterpreterError> {
        self.enter()?;
        if matches!(self.current().kind, TokenKind::Ident(_))
            && matches!(self.peek_kind(1), Some(TokenKind::Punct("=>")))
        {
            return Err(self.error_at(
                self.current().offset,
                "arrow functions are not supported",
            ));
        }
        let target = self.conditional()?;
        if self.is_punct("=>") {
            return Err(self.error_at(self.current().offset, "arrow functions are not supported"));
        }
        let op = match &self.current().kind {
            TokenKind::Punct(p) if ASSIGN_OPS.contains(p) => Some(*p),
            _ => None,
        };
        let expr = match op {
            Some(op) => {
                self.advance();
                let value = self.assignment()?;
                Expr::Assign {
                    op,
                    target: Box::new(target),
                    value: Box::new(value),
                }
            }
            None => target,
        };
        self.leave();
        Ok(expr)
    }

    fn conditional(&mut self) -> Result<Expr, InterpreterError> {
        let test = self.binary(1)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let then = self.assignment()?;
        self.expect_punct(":")?;
        let otherwise = self.assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn binary_op(&self) -> Option<(&'static str, u8)> {
        let op: &'static str = match &self.current().kind {
            TokenKind::Punct(p) => *p,
            TokenKind::Ident(name) if name == "instanceof" => "instanceof",
            TokenKind::Ident(name) if name == "in" => "in",
            _ => return None,
        };
        let prec = match op {
            "??" => 1,
            "||" => 2,
            "&&" => 3,
            "|" => 4,
            "^" => 5,
            "&" => 6,
            "==" | "!=" | "===" | "!==" => 7,
            "<" | ">" | "<=" | ">=" | "instanceof" | "in" => 8,
            "<<" | ">>" | ">>>" => 9,
            "+" | "-" => 10,
            "*" | "/" | "%" => 11,
            "**" => 12,
            _ => return None,
        };
        Some((op, prec))
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, InterpreterError> {
        let mut left = self.unary()?;
        // Each fold nests `left` one level deeper, so it counts against the
        // depth limit until the chain is complete.
        let mut folds = 0usize;
        while let Some((op, prec)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            self.advance();
            self.enter()?;
            folds += 1;
            // `**` is right-associative.
            let next_min = if op == "**" { prec } else { prec + 1 };
            let right = self.binary(next_min)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.leave_n(folds);
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, InterpreterError> {
        self.enter()?;
        let prefix: Option<&'static str> = match &self.current().kind {
            TokenKind::Punct(p @ ("!" | "-" | "+" | "~" | "++" | "--")) => Some(*p),
            TokenKind::Ident(name) => match name.as_str() {
                "typeof" => Some("typeof "),
                "void" => Some("void "),
                "delete" => Some("delete "),
                "await" => Some("await"),
                _ => None,
            },
            _ => None,
        };
        let expr = match prefix {
            Some("await") => {
                self.advance();
                Expr::Await(Box::new(self.unary()?))
            }
            Some(op @ ("++" | "--")) => {
                self.advance();
                Expr::Update {
                    op,
                    prefix: true,
                    arg: Box::new(self.unary()?),
                }
            }
            Some(op) => {
                self.advance();
                Expr::Unary {
                    op,
                    arg: Box::new(self.unary()?),
                }
            }
            None => {
                let expr = self.call_member()?;
                match &self.current().kind {
                    TokenKind::Punct(op @ ("++" | "--")) if !self.current().newline_before => {
                        let op: &'static str = *op;
                        self.advance();
                        Expr::Update {
                            op,
                            prefix: false,
                            arg: Box::new(expr),
                        }
                    }
                    _ => expr,
                }
            }
        };
        self.leave();
        Ok(expr)
    }

    fn call_member(&mut self) -> Result<Expr, InterpreterError> {
        let mut expr = if self.is_ident("new") {
            self.new_expression()?
        } else {
            self.primary()?
        };
        let mut suffixes = 0usize;
        loop {
            let offset = self.current().offset;
            if self.is_suffix_start() {
                self.enter()?;
                suffixes += 1;
            }
            if self.eat_punct(".") {
                let name = self.property_name()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    prop: MemberProp::Named(name),
                    optional: false,
                };
            } else if self.eat_punct("?.") {
                if self.is_punct("(") {
                    let args = self.arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        optional: true,
                        offset,
                    };
                } else if self.eat_punct("[") {
                    let prop = self.expression()?;
                    self.expect_punct("]")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        prop: MemberProp::Computed(Box::new(prop)),
                        optional: true,
                    };
                } else {
                    let name = self.property_name()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        prop: MemberProp::Named(name),
                        optional: true,
                    };
                }
            } else if self.eat_punct("[") {
                let prop = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    prop: MemberProp::Computed(Box::new(prop)),
                    optional: false,
                };
            } else if self.is_punct("(") {
                let args = self.arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    optional: false,
                    offset,
                };
            } else if matches!(self.current().kind, TokenKind::Template { .. }) {
                self.advance();
                expr = Expr::TaggedTemplate {
                    tag: Box::new(expr),
                    offset,
                };
            } else {
                self.leave_n(suffixes);
                return Ok(expr);
            }
        }
    }

    fn is_suffix_start(&self) -> bool {
        [".", "?.", "[", "("].iter().any(|p| self.is_punct(p))
            || matches!(self.current().kind, TokenKind::Template { .. })
    }

    fn new_expression(&mut self) -> Result<Expr, InterpreterError> {
        let offset = self.advance().offset;
        self.enter()?;
        let mut callee = if self.is_ident("new") {
            self.new_expression()?
        } else {
            self.primary()?
        };
        let mut suffixes = 0usize;
        loop {
            if self.is_punct(".") || self.is_punct("[") {
                self.enter()?;
                suffixes += 1;
            }
            if self.eat_punct(".") {
                let name = self.property_name()?;
                callee = Expr::Member {
                    object: Box::new(callee),
                    prop: MemberProp::Named(name),
                    optional: false,
                };
            } else if self.eat_punct("[") {
                let prop = self.expression()?;
                self.expect_punct("]")?;
                callee = Expr::Member {
                    object: Box::new(callee),
                    prop: MemberProp::Computed(Box::new(prop)),
                    optional: false,
                };
            } else {
                break;
            }
        }
        let args = if self.is_punct("(") {
            self.arguments()?
        } else {
            Vec::new()
        };
        self.leave_n(suffixes + 1);
        Ok(Expr::New {
            callee: Box::new(callee),
            args,
            offset,
        })
    }

    fn property_name(&mut self) -> Result<String, InterpreterError> {
        match &self.current().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            TokenKind::Punct("#") => Err(self.error_at(
                self.current().offset,
                "private names are not supported",
            )),
            _ => Err(self.unexpected("expected a property name")),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Arg>, InterpreterError> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        while !self.is_punct(")") {
            if self.eat_punct("...") {
                args.push(Arg::Spread(self.assignment()?));
            } else {
                args.push(Arg::Item(self.assignment()?));
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, InterpreterError> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Str(value) => {
                self.advance();
                Ok(Expr::Str(value))
            }
            TokenKind::Number(value) => {
                self.advance();
                Ok(Expr::Num(value))
            }
            TokenKind::Template { substitutions, .. } if substitutions > 0 => {
                Err(InterpreterError::UnsupportedLiteral {
                    offset: token.offset,
                    reason: "template literal with `${...}` substitutions is not a literal"
                        .to_string(),
                })
            }
            TokenKind::Template {
                cooked,
                substitutions,
            } => {
                self.advance();
                Ok(Expr::Template {
                    cooked,
                    substitutions,
                })
            }
            TokenKind::Ident(name) => match name.as_str() {
                "true" => {
                    self.advance();
                    Ok(Expr::Bool(true))
                }
                "false" => {
                    self.advance();
                    Ok(Expr::Bool(false))
                }
                "null" => {
                    self.advance();
                    Ok(Expr::Null)
                }
                "function" | "class" => Err(self.error_at(
                    token.offset,
                    format!("`{name}` definitions are not supported"),
                )),
                "async" if matches!(self.peek_kind(1), Some(TokenKind::Ident(n)) if n == "function") => {
                    Err(self.error_at(token.offset, "`function` definitions are not supported"))
                }
                kw if UNSUPPORTED_KEYWORDS.contains(&kw) => Err(self.error_at(
                    token.offset,
                    format!("`{kw}` is not supported in expressions"),
                )),
                _ => {
                    self.advance();
                    Ok(Expr::Ident(name.clone()))
                }
            },
            TokenKind::Punct("(") => {
                self.advance();
                self.enter()?;
                let inner = self.expression()?;
                self.expect_punct(")")?;
                self.leave();
                Ok(inner)
            }
            TokenKind::Punct("[") => self.array(),
            TokenKind::Punct("{") => self.object(),
            TokenKind::Punct("/") | TokenKind::Punct("/=") => Err(self.error_at(
                token.offset,
                "regular expression literals are not supported",
            )),
            _ => Err(self.unexpected("expected an expression")),
        }
    }

    fn array(&mut self) -> Result<Expr, InterpreterError> {
        self.expect_punct("[")?;
        self.enter()?;
        let mut items = Vec::new();
        loop {
            if self.eat_punct("]") {
                break;
            }
            if self.eat_punct(",") {
                items.push(ArrayItem::Hole);
                continue;
            }
            let item = if self.eat_punct("...") {
                ArrayItem::Spread(self.assignment()?)
            } else {
                ArrayItem::Item(self.assignment()?)
            };
            items.push(item);
            if self.eat_punct("]") {
                break;
            }
            self.expect_punct(",")?;
        }
        self.leave();
        Ok(Expr::Array(items))
    }

    fn object(&mut self) -> Result<Expr, InterpreterError> {
        self.expect_punct("{")?;
        self.enter()?;
        let mut props = Vec::new();
        loop {
            if self.eat_punct("}") {
                break;
            }
            if self.eat_punct("...") {
                props.push(Property::Spread(self.assignment()?));
            } else {
                props.push(self.property()?);
            }
            if self.eat_punct("}") {
                break;
            }
            self.expect_punct(",")?;
        }
        self.leave();
        Ok(Expr::Object(props))
    }

    fn property(&mut self) -> Result<Property, InterpreterError> {
        let token = self.current().clone();
        let key = match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                if self.is_punct(",") || self.is_punct("}") {
                    return Ok(Property::Shorthand(name));
                }
                let accessor = matches!(name.as_str(), "get" | "set" | "async")
                    && matches!(
                        self.current().kind,
                        TokenKind::Ident(_)
                            | TokenKind::Str(_)
                            | TokenKind::Number(_)
                            | TokenKind::Punct("[")
                    );
                if accessor {
                    return Err(self.error_at(
                        token.offset,
                        "accessor and async methods are not supported",
                    ));
                }
                PropKey::Ident(name)
            }
            TokenKind::Str(value) => {
                self.advance();
                PropKey::Str(value)
            }
            TokenKind::Number(value) => {
                self.advance();
                PropKey::Num(value)
            }
            TokenKind::Punct("[") => {
                self.advance();
                let key = self.assignment()?;
                self.expect_punct("]")?;
                PropKey::Computed(Box::new(key))
            }
            TokenKind::Punct("*") => {
                return Err(self.error_at(token.offset, "generator methods are not supported"))
            }
            _ => return Err(self.unexpected("expected a property key")),
        };
        if self.is_punct("(") {
            return Err(self.error_at(token.offset, "object methods are not supported"));
        }
        if self.is_punct("=") {
            return Err(self.error_at(token.offset, "default initializers are not supported"));
        }
        self.expect_punct(":")?;
        let value = self.assignment()?;
        Ok(Property::KeyValue { key, value })
    }
}
