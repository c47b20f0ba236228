//! Parser for rule predicate expressions.
//!
//! Supported syntax:
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Arithmetic: `+`, `-`, unary `-`
//! - Boolean operators: `&&`, `||`, `!`
//! - Membership: `x in list`
//! - Roots: `principal`, `before`, `after`, `diff`; any other bare
//!   identifier is a path variable
//! - Dot-path access: `principal.claims.email`, `after.balance`
//! - Methods: `.has(x)`, `.hasOnly([..])`, `.hasAny([..])`, `.size()`
//! - Calls: `isAdmin()` (named predicate), `fetch(..)`, `exists(..)`
//! - Literals: integers, floats, `"strings"` or `'strings'`, `true`,
//!   `false`, `null`, `[lists]`
//! - Parentheses for grouping

use crate::rules::errors::CompileError;

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(LitValue),
    List(Vec<Expr>),
    Principal,
    Before,
    After,
    Diff,
    Var(String),
    Member {
        base: Box<Expr>,
        field: String,
    },
    Method {
        receiver: Box<Expr>,
        method: Method,
        args: Vec<Expr>,
    },
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryNot(Box<Expr>),
    Neg(Box<Expr>),
    In {
        element: Box<Expr>,
        collection: Box<Expr>,
    },
    /// Named predicate invocation as written in source.
    Call(String),
    /// Named predicate invocation resolved to its slot in the rule table.
    Predicate(usize),
    Fetch(Vec<Expr>),
    Exists(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Add,
    Sub,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LitValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Has,
    HasOnly,
    HasAny,
    Size,
}

impl Method {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "has" => Some(Method::Has),
            "hasOnly" => Some(Method::HasOnly),
            "hasAny" => Some(Method::HasAny),
            "size" => Some(Method::Size),
            _ => None,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Method::Size => 0,
            Method::Has | Method::HasOnly | Method::HasAny => 1,
        }
    }
}

impl Expr {
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_)
            | Expr::Principal
            | Expr::Before
            | Expr::After
            | Expr::Diff
            | Expr::Var(_)
            | Expr::Call(_)
            | Expr::Predicate(_) => Vec::new(),
            Expr::List(items) | Expr::Fetch(items) | Expr::Exists(items) => items.iter().collect(),
            Expr::Member { base, .. } => vec![base.as_ref()],
            Expr::Method { receiver, args, .. } => {
                std::iter::once(receiver.as_ref()).chain(args).collect()
            }
            Expr::BinOp { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::UnaryNot(inner) | Expr::Neg(inner) => vec![inner.as_ref()],
            Expr::In {
                element,
                collection,
            } => vec![element.as_ref(), collection.as_ref()],
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Literal(_)
            | Expr::Principal
            | Expr::Before
            | Expr::After
            | Expr::Diff
            | Expr::Var(_)
            | Expr::Call(_)
            | Expr::Predicate(_) => Vec::new(),
            Expr::List(items) | Expr::Fetch(items) | Expr::Exists(items) => {
                items.iter_mut().collect()
            }
            Expr::Member { base, .. } => vec![base.as_mut()],
            Expr::Method { receiver, args, .. } => {
                std::iter::once(receiver.as_mut()).chain(args).collect()
            }
            Expr::BinOp { left, right, .. } => vec![left.as_mut(), right.as_mut()],
            Expr::UnaryNot(inner) | Expr::Neg(inner) => vec![inner.as_mut()],
            Expr::In {
                element,
                collection,
            } => vec![element.as_mut(), collection.as_mut()],
        }
    }

    /// Names of the named predicates this expression calls, in source order.
    pub fn called_predicates(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Call(name) = e {
                out.push(name.as_str());
            }
        });
        out
    }

    /// Path variables referenced by this expression.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Var(name) = e {
                out.push(name.as_str());
            }
        });
        out
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }
}

// ─── Parser ─────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,    // ==
    Ne,    // !=
    Gt,    // >
    Lt,    // <
    Ge,    // >=
    Le,    // <=
    Plus,  // +
    Minus, // -
    And,   // &&
    Or,    // ||
    Not,   // !
    In,    // in
}

fn tokenize(input: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let next = chars.get(i + 1).copied();
        match chars[i] {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            quote @ ('"' | '\'') => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(CompileError::InvalidCondition(
                                "unterminated string literal".into(),
                            ));
                        }
                        Some(&c) if c == quote => break,
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or_else(|| {
                                CompileError::InvalidCondition(
                                    "unterminated string literal".into(),
                                )
                            })?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&c) => {
                            s.push(c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
                i += 1; // skip closing quote
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                if num_str.contains('.') {
                    let f: f64 = num_str.parse().map_err(|_| {
                        CompileError::InvalidCondition(format!("invalid float `{num_str}`"))
                    })?;
                    tokens.push(Token::Float(f));
                } else {
                    let n: i64 = num_str.parse().map_err(|_| {
                        CompileError::InvalidCondition(format!("invalid integer `{num_str}`"))
                    })?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    "in" => tokens.push(Token::In),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            c => {
                return Err(CompileError::InvalidCondition(format!(
                    "unexpected character `{c}`"
                )));
            }
        }
    }
    Ok(tokens)
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), CompileError> {
        if self.advance() != Some(expected) {
            return Err(CompileError::InvalidCondition(format!("expected {what}")));
        }
        Ok(())
    }

    /// Entry: parse_or
    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = binop(BinOp::Or, left, right);
        }
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = binop(BinOp::And, left, right);
        }
        Ok(left)
    }

    /// comparison = additive (("==" | "!=" | ">" | "<" | ">=" | "<=" | "in") additive)?
    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Le) => BinOp::Le,
            Some(Token::In) => {
                self.advance();
                let right = self.parse_additive()?;
                return Ok(Expr::In {
                    element: Box::new(left),
                    collection: Box::new(right),
                });
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(binop(op, left, right))
    }

    /// additive = unary (("+" | "-") unary)*
    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binop(op, left, right);
        }
    }

    /// unary = "!" unary | "-" unary | postfix
    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                let expr = self.parse_unary()?;
                Ok(Expr::UnaryNot(Box::new(expr)))
            }
            Some(Token::Minus) => {
                self.advance();
                Ok(match self.parse_unary()? {
                    Expr::Literal(LitValue::Int(n)) => Expr::Literal(LitValue::Int(-n)),
                    Expr::Literal(LitValue::Float(f)) => Expr::Literal(LitValue::Float(-f)),
                    other => Expr::Neg(Box::new(other)),
                })
            }
            _ => self.parse_postfix(),
        }
    }

    /// postfix = primary ("." ident | "." ident "(" args ")")*
    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                _ => {
                    return Err(CompileError::InvalidCondition(
                        "expected identifier after `.`".into(),
                    ));
                }
            };
            if self.peek() == Some(&Token::LParen) {
                self.advance();
                let method = Method::from_name(&name).ok_or_else(|| {
                    CompileError::InvalidCondition(format!("unknown method `{name}`"))
                })?;
                let args = self.parse_args(Token::RParen)?;
                if args.len() != method.arity() {
                    return Err(CompileError::InvalidCondition(format!(
                        "`{name}` takes {} argument(s), got {}",
                        method.arity(),
                        args.len()
                    )));
                }
                expr = Expr::Method {
                    receiver: Box::new(expr),
                    method,
                    args,
                };
            } else {
                expr = Expr::Member {
                    base: Box::new(expr),
                    field: name,
                };
            }
        }
        Ok(expr)
    }

    /// args = (expr ("," expr)*)? closing
    fn parse_args(&mut self, closing: Token) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        if self.peek() == Some(&closing) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(tok) if tok == closing => return Ok(args),
                _ => {
                    return Err(CompileError::InvalidCondition(
                        "expected `,` or end of argument list".into(),
                    ));
                }
            }
        }
    }

    /// primary = literal | "[" args "]" | ident | ident "(" args ")" | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Expr::Literal(LitValue::Int(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(LitValue::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(LitValue::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(LitValue::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(LitValue::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(LitValue::Null)),
            Some(Token::LBracket) => Ok(Expr::List(self.parse_args(Token::RBracket)?)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let args = self.parse_args(Token::RParen)?;
                    return match name.as_str() {
                        "fetch" | "exists" if args.is_empty() => {
                            Err(CompileError::InvalidCondition(format!(
                                "`{name}` requires at least one path segment"
                            )))
                        }
                        "fetch" => Ok(Expr::Fetch(args)),
                        "exists" => Ok(Expr::Exists(args)),
                        _ if !args.is_empty() => Err(CompileError::InvalidCondition(format!(
                            "named predicate `{name}` takes no arguments"
                        ))),
                        _ => Ok(Expr::Call(name)),
                    };
                }
                Ok(match name.as_str() {
                    "principal" => Expr::Principal,
                    "before" => Expr::Before,
                    "after" => Expr::After,
                    "diff" => Expr::Diff,
                    _ => Expr::Var(name),
                })
            }
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(Token::RParen, "closing parenthesis `)`")?;
                Ok(expr)
            }
            other => Err(CompileError::InvalidCondition(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }
}

fn binop(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::BinOp {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Parse a predicate expression string into an AST.
pub fn parse_condition(input: &str) -> Result<Expr, CompileError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(CompileError::InvalidCondition("empty expression".into()));
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(CompileError::InvalidCondition(format!(
            "unexpected trailing token: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(base: Expr, field: &str) -> Expr {
        Expr::Member {
            base: Box::new(base),
            field: field.into(),
        }
    }

    #[test]
    fn test_parse_simple_comparison() {
        let expr = parse_condition("userId == 5").unwrap();
        assert_eq!(
            expr,
            binop(
                BinOp::Eq,
                Expr::Var("userId".into()),
                Expr::Literal(LitValue::Int(5))
            )
        );
    }

    #[test]
    fn test_parse_roots_and_dot_path() {
        let expr = parse_condition("principal.claims.email").unwrap();
        assert_eq!(expr, member(member(Expr::Principal, "claims"), "email"));

        let expr = parse_condition("after.profile.name").unwrap();
        assert_eq!(expr, member(member(Expr::After, "profile"), "name"));

        assert_eq!(parse_condition("before").unwrap(), Expr::Before);
        assert_eq!(parse_condition("diff").unwrap(), Expr::Diff);
    }

    #[test]
    fn test_parse_arithmetic_binds_tighter_than_comparison() {
        let expr = parse_condition("after.balance == before.balance + 5.00").unwrap();
        assert_eq!(
            expr,
            binop(
                BinOp::Eq,
                member(Expr::After, "balance"),
                binop(
                    BinOp::Add,
                    member(Expr::Before, "balance"),
                    Expr::Literal(LitValue::Float(5.0))
                )
            )
        );
    }

    #[test]
    fn test_parse_subtraction_is_left_associative() {
        let expr = parse_condition("10 - 3 - 2").unwrap();
        assert_eq!(
            expr,
            binop(
                BinOp::Sub,
                binop(
                    BinOp::Sub,
                    Expr::Literal(LitValue::Int(10)),
                    Expr::Literal(LitValue::Int(3))
                ),
                Expr::Literal(LitValue::Int(2))
            )
        );
    }

    #[test]
    fn test_parse_negative_literal() {
        assert_eq!(
            parse_condition("-5").unwrap(),
            Expr::Literal(LitValue::Int(-5))
        );
        assert_eq!(
            parse_condition("-after.x").unwrap(),
            Expr::Neg(Box::new(member(Expr::After, "x")))
        );
    }

    #[test]
    fn test_parse_method_calls() {
        let expr = parse_condition("diff.hasOnly(['balance', \"totalEarned\"])").unwrap();
        assert_eq!(
            expr,
            Expr::Method {
                receiver: Box::new(Expr::Diff),
                method: Method::HasOnly,
                args: vec![Expr::List(vec![
                    Expr::Literal(LitValue::Str("balance".into())),
                    Expr::Literal(LitValue::Str("totalEarned".into())),
                ])],
            }
        );

        assert!(matches!(
            parse_condition("diff.size()").unwrap(),
            Expr::Method {
                method: Method::Size,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_method_arity_and_unknown() {
        assert!(parse_condition("diff.has()").is_err());
        assert!(parse_condition("diff.size(1)").is_err());
        assert!(parse_condition("diff.keys()").is_err());
    }

    #[test]
    fn test_parse_calls() {
        assert_eq!(
            parse_condition("isAdmin()").unwrap(),
            Expr::Call("isAdmin".into())
        );
        assert!(parse_condition("isAdmin(1)").is_err());

        let expr = parse_condition("fetch('users', principal.id).balance").unwrap();
        assert_eq!(
            expr,
            member(
                Expr::Fetch(vec![
                    Expr::Literal(LitValue::Str("users".into())),
                    member(Expr::Principal, "id"),
                ]),
                "balance"
            )
        );
        assert!(matches!(
            parse_condition("exists('users/u1')").unwrap(),
            Expr::Exists(_)
        ));
        assert!(parse_condition("fetch()").is_err());
    }

    #[test]
    fn test_parse_in_operator() {
        let expr = parse_condition("principal.id in ['a', 'b']").unwrap();
        assert!(matches!(expr, Expr::In { .. }));
    }

    #[test]
    fn test_parse_not_operator() {
        let expr = parse_condition("!exists('flags', userId)").unwrap();
        assert!(matches!(expr, Expr::UnaryNot(_)));
    }

    #[test]
    fn test_parse_parentheses() {
        let expr = parse_condition("(a || b) && c").unwrap();
        match expr {
            Expr::BinOp {
                op: BinOp::And,
                left,
                ..
            } => assert!(matches!(*left, Expr::BinOp { op: BinOp::Or, .. })),
            _ => panic!("expected And"),
        }
    }

    #[test]
    fn test_parse_string_escapes() {
        let expr = parse_condition(r#"x == 'it\'s'"#).unwrap();
        assert_eq!(
            expr,
            binop(
                BinOp::Eq,
                Expr::Var("x".into()),
                Expr::Literal(LitValue::Str("it's".into()))
            )
        );
    }

    #[test]
    fn test_called_predicates_and_variables() {
        let expr = parse_condition("isAdmin() || (userId == principal.id && isOwner())").unwrap();
        assert_eq!(expr.called_predicates(), vec!["isAdmin", "isOwner"]);
        assert_eq!(expr.variables(), vec!["userId"]);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(parse_condition("").is_err());
        assert!(parse_condition(r#""hello"#).is_err());
        assert!(parse_condition("a == ").is_err());
        assert!(parse_condition("(a").is_err());
        assert!(parse_condition("a b").is_err());
        assert!(parse_condition("a # b").is_err());
        assert!(parse_condition("1.2.3 == x").is_err());
    }
}
