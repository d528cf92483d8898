use std::str::FromStr;

use crate::error::DomainError;
use crate::labels::{Label, LabelSet};

/// Parsed label filter expression.
///
/// Grammar (lowest precedence first):
/// ```text
/// list    := or ( "," or )*
/// or      := and ( "||" and )*
/// and     := unary ( "&&" unary )*
/// unary   := "!" unary | primary
/// primary := "(" list ")" | LABEL
/// ```
/// An empty filter matches every label set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    source: String,
    expr:   Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Label(Label),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn eval(&self, labels: &LabelSet) -> bool {
        match self {
            Expr::Label(l)  => labels.contains(*l),
            Expr::Not(e)    => !e.eval(labels),
            Expr::And(a, b) => a.eval(labels) && b.eval(labels),
            Expr::Or(a, b)  => a.eval(labels) || b.eval(labels),
        }
    }
}

impl LabelFilter {
    pub fn parse(source: &str) -> Result<Self, DomainError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Ok(Self::match_all());
        }
        let mut parser = Parser { tokens: &tokens, pos: 0, source };
        let expr = parser.list()?;
        if let Some(tok) = parser.peek() {
            return Err(parser.error(format!("unexpected {}", tok.describe())));
        }
        Ok(Self { source: source.trim().to_string(), expr: Some(expr) })
    }

    pub fn match_all() -> Self {
        Self { source: String::new(), expr: None }
    }

    /// A filter that selects exactly the sets containing `label`.
    pub fn label(label: Label) -> Self {
        Self { source: label.as_str().to_string(), expr: Some(Expr::Label(label)) }
    }

    /// Conjunction of two filters; an empty side is ignored.
    pub fn and(self, other: LabelFilter) -> Self {
        match (self.expr, other.expr) {
            (None, e) => Self { source: other.source, expr: e },
            (e, None) => Self { source: self.source, expr: e },
            (Some(a), Some(b)) => Self {
                source: format!("({}) && ({})", self.source, other.source),
                expr:   Some(Expr::And(Box::new(a), Box::new(b))),
            },
        }
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.expr.as_ref().map_or(true, |e| e.eval(labels))
    }

    pub fn is_empty(&self) -> bool {
        self.expr.is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl Default for LabelFilter {
    fn default() -> Self {
        Self::match_all()
    }
}

impl FromStr for LabelFilter {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LabelFilter::parse(s)
    }
}

impl std::fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.source.is_empty() {
            f.write_str("<all>")
        } else {
            f.write_str(&self.source)
        }
    }
}

// ── Tokenizer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Label(Label),
    And,
    Or,
    Comma,
    Not,
    Open,
    Close,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Label(l) => format!("label '{}'", l),
            Token::And      => "'&&'".into(),
            Token::Or       => "'||'".into(),
            Token::Comma    => "','".into(),
            Token::Not      => "'!'".into(),
            Token::Open     => "'('".into(),
            Token::Close    => "')'".into(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, DomainError> {
    let invalid = |message: String| DomainError::InvalidFilter {
        filter: source.to_string(),
        message,
    };

    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => { tokens.push(Token::Open); i += 1; }
            ')' => { tokens.push(Token::Close); i += 1; }
            ',' => { tokens.push(Token::Comma); i += 1; }
            '!' => { tokens.push(Token::Not); i += 1; }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(invalid(format!("expected '{c}{c}' at position {i}")));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '-' || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let label = word.parse::<Label>().map_err(|_| {
                    invalid(format!("unknown label '{}'", word))
                })?;
                tokens.push(Token::Label(label));
            }
            other => return Err(invalid(format!("unexpected character '{other}' at position {i}"))),
        }
    }
    Ok(tokens)
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser<'a> {
    tokens: &'a [Token],
    pos:    usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn error(&self, message: String) -> DomainError {
        DomainError::InvalidFilter { filter: self.source.to_string(), message }
    }

    fn list(&mut self) -> Result<Expr, DomainError> {
        let mut lhs = self.or()?;
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            let rhs = self.or()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Expr, DomainError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, DomainError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, DomainError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, DomainError> {
        match self.next() {
            Some(Token::Label(l)) => Ok(Expr::Label(*l)),
            Some(Token::Open) => {
                let inner = self.list()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    Some(tok) => Err(self.error(format!("expected ')', found {}", tok.describe()))),
                    None => Err(self.error("unbalanced '('".into())),
                }
            }
            Some(tok) => Err(self.error(format!("unexpected {}", tok.describe()))),
            None => Err(self.error("unexpected end of expression".into())),
        }
    }
}
