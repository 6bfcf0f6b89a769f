//! Tag expression parsing and evaluation.
//!
//! Sessions narrow their view of the backend fleet with one of three query
//! parameters: `tags` (simple OR list), `tag-filter` (boolean expression),
//! or `preset` (named stored filter). Operator precedence is
//! NOT > AND > OR, parentheses override.

use std::collections::{BTreeMap, BTreeSet};

use magg_config::{PresetConfig, is_valid_tag};
use magg_core::ProxyError;

/// Example filters quoted back to clients on parse failures.
pub const FILTER_EXAMPLES: &[&str] = &[
    "tags=web,api",
    "tag-filter=web+prod",
    "tag-filter=(web,api)+!dev",
    "preset=dev",
];

pub const MULTIPLE_FILTER_PARAMS_MESSAGE: &str =
    "Cannot use multiple filtering parameters simultaneously. \
     Use exactly one of 'tags', 'tag-filter', or 'preset'.";

/// Boolean expression tree over backend tag sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagExpr {
    Tag(String),
    And(Vec<TagExpr>),
    Or(Vec<TagExpr>),
    Not(Box<TagExpr>),
}

impl TagExpr {
    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            Self::Tag(tag) => tags.contains(tag),
            Self::And(children) => children.iter().all(|c| c.matches(tags)),
            Self::Or(children) => children.iter().any(|c| c.matches(tags)),
            Self::Not(child) => !child.matches(tags),
        }
    }

    fn collect_tags(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Tag(tag) => {
                out.insert(tag.clone());
            }
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_tags(out);
                }
            }
            Self::Not(child) => child.collect_tags(out),
        }
    }

    /// Canonical text form, re-parsable by [`parse_tag_expression`].
    pub fn render(&self) -> String {
        match self {
            Self::Tag(tag) => tag.clone(),
            Self::And(children) => children
                .iter()
                .map(|c| c.render_grouped(Precedence::And))
                .collect::<Vec<_>>()
                .join("+"),
            Self::Or(children) => children
                .iter()
                .map(|c| c.render_grouped(Precedence::Or))
                .collect::<Vec<_>>()
                .join(","),
            Self::Not(child) => format!("!{}", child.render_grouped(Precedence::Not)),
        }
    }

    fn render_grouped(&self, parent: Precedence) -> String {
        let needs_parens = self.precedence() < parent;
        if needs_parens {
            format!("({})", self.render())
        } else {
            self.render()
        }
    }

    fn precedence(&self) -> Precedence {
        match self {
            Self::Or(_) => Precedence::Or,
            Self::And(_) => Precedence::And,
            Self::Not(_) | Self::Tag(_) => Precedence::Not,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Or,
    And,
    Not,
}

/// Per-session backend filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TagFilter {
    /// Admit every backend.
    #[default]
    None,
    SimpleOr(Vec<String>),
    Advanced(TagExpr),
    Preset { name: String, expr: TagExpr },
}

impl TagFilter {
    /// True iff a backend carrying `tags` is visible under this filter.
    pub fn admits(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            Self::None => true,
            Self::SimpleOr(wanted) => wanted.iter().any(|t| tags.contains(t)),
            Self::Advanced(expr) | Self::Preset { expr, .. } => expr.matches(tags),
        }
    }

    /// Every tag name the filter mentions, for scope validation.
    pub fn referenced_tags(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        match self {
            Self::None => {}
            Self::SimpleOr(tags) => out.extend(tags.iter().cloned()),
            Self::Advanced(expr) | Self::Preset { expr, .. } => expr.collect_tags(&mut out),
        }
        out
    }

    pub fn preset_name(&self) -> Option<&str> {
        match self {
            Self::Preset { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Resolve the three mutually exclusive query parameters into a filter.
    pub fn from_params(
        tags: Option<&str>,
        tag_filter: Option<&str>,
        preset: Option<&str>,
        presets: &BTreeMap<String, PresetConfig>,
    ) -> Result<Self, ProxyError> {
        let given = [tags.is_some(), tag_filter.is_some(), preset.is_some()]
            .iter()
            .filter(|present| **present)
            .count();
        if given > 1 {
            return Err(ProxyError::InvalidParams(
                MULTIPLE_FILTER_PARAMS_MESSAGE.to_string(),
            ));
        }

        if let Some(list) = tags {
            let tags = parse_simple_tags(list)?;
            if tags.is_empty() {
                return Ok(Self::None);
            }
            return Ok(Self::SimpleOr(tags));
        }

        if let Some(expr) = tag_filter {
            if expr.trim().is_empty() {
                return Ok(Self::None);
            }
            return Ok(Self::Advanced(parse_tag_expression(expr)?));
        }

        if let Some(name) = preset {
            let config = presets.get(name).ok_or_else(|| {
                ProxyError::InvalidParams(format!(
                    "Unknown preset '{name}'. Examples: {}",
                    FILTER_EXAMPLES.join(", ")
                ))
            })?;
            let expression = config.to_expression().ok_or_else(|| {
                ProxyError::InvalidParams(format!("Preset '{name}' resolves to an empty filter"))
            })?;
            let expr = parse_tag_expression(&expression).map_err(|err| {
                ProxyError::InvalidParams(format!(
                    "Preset '{name}' has an invalid expression: {err}"
                ))
            })?;
            return Ok(Self::Preset {
                name: name.to_string(),
                expr,
            });
        }

        Ok(Self::None)
    }
}

fn parse_simple_tags(list: &str) -> Result<Vec<String>, ProxyError> {
    let mut tags = Vec::new();
    for raw in list.split(',') {
        let tag = raw.trim();
        if tag.is_empty() {
            continue;
        }
        if !is_valid_tag(tag) {
            return Err(ProxyError::InvalidParams(format!(
                "Invalid tag '{tag}'. Examples: {}",
                FILTER_EXAMPLES.join(", ")
            )));
        }
        tags.push(tag.to_string());
    }
    Ok(tags)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Tag(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ProxyError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((pos, ch)) = chars.next() {
        match ch {
            ch if ch.is_whitespace() => {}
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            ',' => tokens.push(Token::Or),
            '+' => tokens.push(Token::And),
            '!' => tokens.push(Token::Not),
            '|' => match chars.next() {
                Some((_, '|')) => tokens.push(Token::Or),
                _ => {
                    return Err(invalid_expression(input, pos, "expected '||'"));
                }
            },
            '&' => match chars.next() {
                Some((_, '&')) => tokens.push(Token::And),
                _ => {
                    return Err(invalid_expression(input, pos, "expected '&&'"));
                }
            },
            ch if ch.is_ascii_alphabetic() || ch == '_' => {
                let mut word = String::new();
                word.push(ch);
                while let Some((_, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || *next == '_' || *next == '-' {
                        word.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Tag(word)),
                }
            }
            _ => {
                return Err(invalid_expression(input, pos, "unexpected character"));
            }
        }
    }

    Ok(tokens)
}

fn invalid_expression(input: &str, pos: usize, reason: &str) -> ProxyError {
    ProxyError::InvalidParams(format!(
        "Invalid tag expression '{input}' at offset {pos}: {reason}. Examples: {}",
        FILTER_EXAMPLES.join(", ")
    ))
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, reason: &str) -> ProxyError {
        ProxyError::InvalidParams(format!(
            "Invalid tag expression '{}': {reason}. Examples: {}",
            self.input,
            FILTER_EXAMPLES.join(", ")
        ))
    }

    fn parse_or(&mut self) -> Result<TagExpr, ProxyError> {
        let mut children = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            children.push(self.parse_and()?);
        }
        if children.len() == 1 {
            Ok(children.pop().expect("one child"))
        } else {
            Ok(TagExpr::Or(children))
        }
    }

    fn parse_and(&mut self) -> Result<TagExpr, ProxyError> {
        let mut children = vec![self.parse_unary()?];
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            children.push(self.parse_unary()?);
        }
        if children.len() == 1 {
            Ok(children.pop().expect("one child"))
        } else {
            Ok(TagExpr::And(children))
        }
    }

    fn parse_unary(&mut self) -> Result<TagExpr, ProxyError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.bump();
            return Ok(TagExpr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<TagExpr, ProxyError> {
        match self.bump() {
            Some(Token::Open) => {
                let expr = self.parse_or()?;
                match self.bump() {
                    Some(Token::Close) => Ok(expr),
                    _ => Err(self.error("missing closing parenthesis")),
                }
            }
            Some(Token::Tag(tag)) => Ok(TagExpr::Tag(tag)),
            Some(_) => Err(self.error("expected a tag or '('")),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

/// Parse a `tag-filter` expression into its tree form.
pub fn parse_tag_expression(input: &str) -> Result<TagExpr, ProxyError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ProxyError::InvalidParams(format!(
            "Empty tag expression. Examples: {}",
            FILTER_EXAMPLES.join(", ")
        )));
    }
    let mut parser = Parser {
        input,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if parser.peek().is_some() {
        return Err(parser.error("trailing tokens after expression"));
    }
    Ok(expr)
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod tests;
