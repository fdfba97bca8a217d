//! Expression language used by `if:` conditions and `${{ }}` templates

use std::fmt;
use thiserror::Error;

/// Errors raised while parsing an expression
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("Unexpected character '{ch}' at offset {offset} in `{source_text}`")]
    UnexpectedChar {
        ch: char,
        offset: usize,
        source_text: String,
    },

    #[error("Unterminated string literal in `{0}`")]
    UnterminatedString(String),

    #[error("Unexpected {found} in `{source_text}`")]
    UnexpectedToken { found: String, source_text: String },

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Function '{name}' takes {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Unterminated `${{{{` in `{0}`")]
    UnterminatedTemplate(String),

    #[error("Condition `{0}` mixes `${{{{ }}}}` templates with bare expressions; wrap the whole condition or none of it")]
    MixedTemplate(String),
}

/// Runtime value of an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
        }
    }

    /// String form used when a value is interpolated into a template
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
        }
    }

    /// Loose equality: strings compare case-insensitively, a number and a
    /// numeric string compare by value.
    fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
                s.trim().parse::<f64>().map(|v| v == *n).unwrap_or(false)
            }
            (a, b) => a.render().eq_ignore_ascii_case(&b.render()),
        }
    }
}

/// Resolves dotted context paths (`github.ref`, `matrix.python-version`)
pub trait Resolver {
    fn resolve(&self, path: &str) -> Value;
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

/// Built-in functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    StartsWith,
    EndsWith,
    Contains,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "startswith" => Some(Function::StartsWith),
            "endswith" => Some(Function::EndsWith),
            "contains" => Some(Function::Contains),
            _ => None,
        }
    }
}

impl Expr {
    pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            source,
        };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(token) => Err(parser.unexpected(token.clone())),
        }
    }

    pub fn evaluate(&self, resolver: &dyn Resolver) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(path) => resolver.resolve(path),
            Expr::Not(inner) => Value::Bool(!inner.evaluate(resolver).is_truthy()),
            Expr::And(lhs, rhs) => {
                let left = lhs.evaluate(resolver);
                if left.is_truthy() {
                    rhs.evaluate(resolver)
                } else {
                    left
                }
            }
            Expr::Or(lhs, rhs) => {
                let left = lhs.evaluate(resolver);
                if left.is_truthy() {
                    left
                } else {
                    rhs.evaluate(resolver)
                }
            }
            Expr::Eq(lhs, rhs) => {
                Value::Bool(lhs.evaluate(resolver).loosely_equals(&rhs.evaluate(resolver)))
            }
            Expr::Ne(lhs, rhs) => {
                Value::Bool(!lhs.evaluate(resolver).loosely_equals(&rhs.evaluate(resolver)))
            }
            Expr::Call(function, args) => {
                let haystack = args[0].evaluate(resolver).render().to_ascii_lowercase();
                let needle = args[1].evaluate(resolver).render().to_ascii_lowercase();
                Value::Bool(match function {
                    Function::StartsWith => haystack.starts_with(&needle),
                    Function::EndsWith => haystack.ends_with(&needle),
                    Function::Contains => haystack.contains(&needle),
                })
            }
        }
    }
}

/// A parsed `if:` condition that keeps its source text for messages
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse a condition; a single `${{ }}` around the whole text is
    /// accepted and stripped.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let trimmed = source.trim();
        let wrapped = trimmed
            .strip_prefix("${{")
            .and_then(|s| s.strip_suffix("}}"))
            .filter(|inner| !inner.contains("${{") && !inner.contains("}}"));
        let inner = match wrapped {
            Some(inner) => inner,
            None if trimmed.contains("${{") || trimmed.contains("}}") => {
                return Err(ExpressionError::MixedTemplate(trimmed.to_string()))
            }
            None => trimmed,
        };
        Ok(Self {
            source: trimmed.to_string(),
            expr: Expr::parse(inner)?,
        })
    }

    pub fn evaluate(&self, resolver: &dyn Resolver) -> bool {
        self.expr.evaluate(resolver).is_truthy()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Replace every `${{ expr }}` in `template` with the rendered value
pub fn render_template(template: &str, resolver: &dyn Resolver) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after
            .find("}}")
            .ok_or_else(|| ExpressionError::UnterminatedTemplate(template.to_string()))?;
        let expr = Expr::parse(&after[..end])?;
        out.push_str(&expr.evaluate(resolver).render());
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Check every `${{ }}` in `template` parses, without evaluating
pub fn check_template(template: &str) -> Result<(), ExpressionError> {
    struct Nothing;
    impl Resolver for Nothing {
        fn resolve(&self, _path: &str) -> Value {
            Value::Null
        }
    }
    render_template(template, &Nothing).map(|_| ())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Str(String),
    Num(f64),
    Ident(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::Not => f.write_str("'!'"),
            Token::And => f.write_str("'&&'"),
            Token::Or => f.write_str("'||'"),
            Token::Eq => f.write_str("'=='"),
            Token::Ne => f.write_str("'!='"),
            Token::Str(s) => write!(f, "string '{}'", s),
            Token::Num(n) => write!(f, "number {}", n),
            Token::Ident(s) => write!(f, "'{}'", s),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let unexpected = |offset: usize, ch: char| ExpressionError::UnexpectedChar {
        ch,
        offset,
        source_text: source.to_string(),
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' => {
                // '' escapes a quote inside a literal
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::UnterminatedString(source.to_string())),
                        Some((_, '\'')) if chars.get(i + 1).map(|(_, c)| *c) == Some('\'') => {
                            literal.push('\'');
                            i += 2;
                        }
                        Some((_, '\'')) => {
                            i += 1;
                            break;
                        }
                        Some((_, ch)) => {
                            literal.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let number = text.parse::<f64>().map_err(|_| unexpected(offset, c))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_ascii_alphanumeric() || matches!(chars[i].1, '_' | '-' | '.'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().map(|(_, c)| *c).collect()));
            }
            other => return Err(unexpected(offset, other)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self, token: Token) -> ExpressionError {
        ExpressionError::UnexpectedToken {
            found: token.to_string(),
            source_text: self.source.to_string(),
        }
    }

    fn end_of_input(&self) -> ExpressionError {
        ExpressionError::UnexpectedToken {
            found: "end of expression".to_string(),
            source_text: self.source.to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_comparison()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let lhs = self.parse_unary()?;
        if self.eat(&Token::Eq) {
            let rhs = self.parse_unary()?;
            return Ok(Expr::Eq(Box::new(lhs), Box::new(rhs)));
        }
        if self.eat(&Token::Ne) {
            let rhs = self.parse_unary()?;
            return Ok(Expr::Ne(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            None => Err(self.end_of_input()),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(match self.peek() {
                        Some(token) => self.unexpected(token.clone()),
                        None => self.end_of_input(),
                    });
                }
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Ident(name)) => {
                let keyword = match name.as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" => Some(Value::Null),
                    _ => None,
                };
                if let Some(value) = keyword {
                    Ok(Expr::Literal(value))
                } else if self.peek() == Some(&Token::LParen) {
                    self.parse_call(name)
                } else {
                    Ok(Expr::Path(name))
                }
            }
            Some(token) => Err(self.unexpected(token)),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, ExpressionError> {
        let function = Function::lookup(&name).ok_or(ExpressionError::UnknownFunction(name.clone()))?;
        self.advance(); // (
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                if self.eat(&Token::RParen) {
                    break;
                }
                return Err(match self.peek() {
                    Some(token) => self.unexpected(token.clone()),
                    None => self.end_of_input(),
                });
            }
        }
        if args.len() != 2 {
            return Err(ExpressionError::Arity {
                name,
                expected: 2,
                got: args.len(),
            });
        }
        Ok(Expr::Call(function, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapResolver(HashMap<&'static str, &'static str>);

    impl Resolver for MapResolver {
        fn resolve(&self, path: &str) -> Value {
            self.0
                .get(path)
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null)
        }
    }

    fn resolver() -> MapResolver {
        MapResolver(HashMap::from([
            ("github.event_name", "push"),
            ("github.ref", "refs/heads/main"),
            ("matrix.python-version", "3.12"),
        ]))
    }

    fn eval(source: &str) -> bool {
        Condition::parse(source).unwrap().evaluate(&resolver())
    }

    #[test]
    fn test_comparisons_and_boolean_ops() {
        assert!(eval("github.event_name == 'push' && github.ref == 'refs/heads/main'"));
        assert!(!eval("github.event_name == 'pull_request'"));
        assert!(eval("github.event_name != 'pull_request'"));
        assert!(eval("github.event_name == 'pull_request' || matrix.python-version == '3.12'"));
        assert!(eval("!(github.event_name == 'pull_request')"));
    }

    #[test]
    fn test_wrapped_condition_and_case_insensitive_strings() {
        assert!(eval("${{ github.event_name == 'PUSH' }}"));
    }

    #[test]
    fn test_partially_wrapped_condition_is_rejected() {
        for source in [
            "${{ github.event_name == 'push' }} && ${{ github.ref == 'refs/heads/main' }}",
            "github.event_name == 'push' && ${{ github.ref == 'refs/heads/main' }}",
        ] {
            assert!(matches!(
                Condition::parse(source),
                Err(ExpressionError::MixedTemplate(_))
            ));
        }
        assert!(eval("  ${{ github.ref == 'refs/heads/main' }}  "));
    }

    #[test]
    fn test_numbers_compare_with_numeric_strings() {
        assert!(eval("matrix.python-version == 3.12"));
        assert!(!eval("matrix.python-version == 3.1"));
    }

    #[test]
    fn test_unknown_paths_are_null() {
        assert!(!eval("github.missing"));
        assert!(eval("github.missing == null"));
    }

    #[test]
    fn test_functions() {
        assert!(eval("startsWith(github.ref, 'refs/heads/')"));
        assert!(eval("endsWith(github.ref, '/main')"));
        assert!(eval("contains(matrix.python-version, '.1')"));
        assert!(matches!(
            Condition::parse("startsWith(github.ref)"),
            Err(ExpressionError::Arity { .. })
        ));
        assert!(matches!(
            Condition::parse("frobnicate(1, 2)"),
            Err(ExpressionError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_or_returns_operand_value() {
        let expr = Expr::parse("github.missing || 'fallback'").unwrap();
        assert_eq!(expr.evaluate(&resolver()).render(), "fallback");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Condition::parse("github.ref ==").is_err());
        assert!(Condition::parse("'unterminated").is_err());
        assert!(Condition::parse("(a == 'b'").is_err());
        assert!(Condition::parse("a = b").is_err());
    }

    #[test]
    fn test_render_template() {
        let rendered = render_template(
            "uv sync --python ${{ matrix.python-version }} on ${{github.ref}}",
            &resolver(),
        )
        .unwrap();
        assert_eq!(rendered, "uv sync --python 3.12 on refs/heads/main");
        assert_eq!(render_template("no templates", &resolver()).unwrap(), "no templates");
        assert!(render_template("${{ github.ref", &resolver()).is_err());
        assert!(check_template("${{ a == ").is_err());
    }

    #[test]
    fn test_escaped_quote_in_literal() {
        let expr = Expr::parse("'it''s'").unwrap();
        assert_eq!(expr.evaluate(&resolver()).render(), "it's");
    }
}
