//! 🧩 Filter pattern language: parsed once at configuration time, evaluated per record.
//!
//! Three flavours, picked by how the pattern looks:
//!
//! | Shape | Example | Meaning |
//! |---|---|---|
//! | empty | `""` | everything matches |
//! | terms | `ERROR "conn reset" ?timeout -healthcheck` | plain terms all present, at least one `?` term present (if any), no `-` term present |
//! | JSON selector | `{ $.level = "ERR*" && $.latency_ms > 250 }` | field comparisons over a JSON payload; `&&` binds tighter than `\|\|` |
//! | regex | `%status=5\d\d%` | regex search over the payload text |
//!
//! Terms are case-sensitive substrings, which is exactly what you want for
//! `key=value` log lines (`level=ERROR`, `status=503`).
//!
//! ⚠️ A pattern that does not parse is a configuration error. It never reaches a record.

use memchr::memmem;
use regex::Regex;
use serde_json::Value;

/// 💀 Everything that can go wrong while parsing a filter pattern.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("unterminated quote in pattern")]
    UnterminatedQuote,
    #[error("JSON selector pattern must be wrapped in {{ ... }}")]
    UnterminatedSelector,
    #[error("empty term after '{0}' prefix")]
    EmptyTerm(char),
    #[error("invalid selector path '{0}': expected $.field, $.field.nested or $.list[0]")]
    BadPath(String),
    #[error("unexpected character '{0}' in JSON selector")]
    UnexpectedChar(char),
    #[error("expected {expected} in JSON selector, found {found}")]
    Expected {
        expected: &'static str,
        found: String,
    },
    #[error("operator '{0}' cannot compare text, only = and != can")]
    TextOrdering(&'static str),
    #[error("empty JSON selector")]
    EmptySelector,
    #[error("empty regex pattern")]
    EmptyRegex,
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
}

/// 🎭 A compiled filter pattern.
#[derive(Debug, Clone)]
pub enum FilterPattern {
    /// ✅ the empty pattern: everyone gets in
    MatchAll,
    Terms(TermPattern),
    Json(JsonPattern),
    Regex(Regex),
}

impl FilterPattern {
    /// 🔧 Compile a pattern string. Whitespace-only counts as empty.
    pub fn parse(source: &str) -> Result<Self, PatternError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Ok(FilterPattern::MatchAll);
        }
        if trimmed.starts_with('{') {
            let inner = trimmed
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
                .ok_or(PatternError::UnterminatedSelector)?;
            return JsonPattern::parse(inner).map(FilterPattern::Json);
        }
        if trimmed.len() >= 2 && trimmed.starts_with('%') && trimmed.ends_with('%') {
            let inner = &trimmed[1..trimmed.len() - 1];
            if inner.is_empty() {
                return Err(PatternError::EmptyRegex);
            }
            return Ok(FilterPattern::Regex(Regex::new(inner)?));
        }
        TermPattern::parse(trimmed).map(FilterPattern::Terms)
    }

    /// 🎯 Does this text match? `MatchAll` does not even look.
    pub fn matches_text(&self, text: &str) -> bool {
        match self {
            FilterPattern::MatchAll => true,
            FilterPattern::Terms(terms) => terms.matches(text),
            FilterPattern::Json(json) => json.matches(text),
            FilterPattern::Regex(regex) => regex.is_match(text),
        }
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, FilterPattern::MatchAll)
    }
}

// ============================================================
// 🔤 Term patterns
// ============================================================

/// 🔤 Space separated terms with `?` (any-of) and `-` (none-of) prefixes.
#[derive(Debug, Clone, Default)]
pub struct TermPattern {
    required: Vec<String>,
    any_of: Vec<String>,
    excluded: Vec<String>,
}

impl TermPattern {
    fn parse(source: &str) -> Result<Self, PatternError> {
        let mut pattern = TermPattern::default();
        let mut chars = source.chars().peekable();

        loop {
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            let Some(&first) = chars.peek() else {
                break;
            };

            let prefix = match first {
                '?' | '-' => {
                    chars.next();
                    Some(first)
                }
                _ => None,
            };

            let mut term = String::new();
            if chars.peek() == Some(&'"') {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                term.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => term.push(other),
                    }
                }
                if !closed {
                    return Err(PatternError::UnterminatedQuote);
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    term.push(c);
                    chars.next();
                }
            }

            if term.is_empty() {
                return Err(PatternError::EmptyTerm(prefix.unwrap_or('"')));
            }

            match prefix {
                Some('?') => pattern.any_of.push(term),
                Some('-') => pattern.excluded.push(term),
                _ => pattern.required.push(term),
            }
        }

        Ok(pattern)
    }

    fn matches(&self, text: &str) -> bool {
        let haystack = text.as_bytes();
        let contains = |needle: &String| memmem::find(haystack, needle.as_bytes()).is_some();

        self.required.iter().all(contains)
            && (self.any_of.is_empty() || self.any_of.iter().any(contains))
            && !self.excluded.iter().any(contains)
    }
}

// ============================================================
// 🧬 JSON selector patterns
// ============================================================

/// 🧬 `{ $.a = "x" && $.b > 3 || $.c IS TRUE }`: OR of AND-groups of conditions.
#[derive(Debug, Clone)]
pub struct JsonPattern {
    any_of_groups: Vec<Vec<Condition>>,
}

#[derive(Debug, Clone, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

#[derive(Debug, Clone)]
enum TextMatcher {
    Exact(String),
    Glob(Regex),
}

impl TextMatcher {
    fn new(literal: String) -> Result<Self, PatternError> {
        if !literal.contains('*') {
            return Ok(TextMatcher::Exact(literal));
        }
        let pieces: Vec<String> = literal.split('*').map(regex::escape).collect();
        let anchored = format!("^{}$", pieces.join(".*"));
        Ok(TextMatcher::Glob(Regex::new(&anchored)?))
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            TextMatcher::Exact(expected) => expected == text,
            TextMatcher::Glob(regex) => regex.is_match(text),
        }
    }
}

#[derive(Debug, Clone)]
enum Comparison {
    Text { negate: bool, matcher: TextMatcher },
    Number { op: CompareOp, value: f64 },
    IsTrue,
    IsFalse,
    IsNull,
    NotExists,
}

#[derive(Debug, Clone)]
struct Condition {
    path: Vec<PathSegment>,
    comparison: Comparison,
}

impl Condition {
    fn evaluate(&self, document: &Value) -> bool {
        let found = resolve(document, &self.path);
        match (&self.comparison, found) {
            (Comparison::NotExists, found) => found.is_none(),
            (_, None) => false,
            (Comparison::Text { negate, matcher }, Some(value)) => {
                let rendered = match value {
                    Value::String(text) => text.clone(),
                    Value::Number(number) => number.to_string(),
                    Value::Bool(flag) => flag.to_string(),
                    _ => return false,
                };
                matcher.matches(&rendered) != *negate
            }
            (Comparison::Number { op, value: expected }, Some(value)) => {
                let actual = match value {
                    Value::Number(number) => number.as_f64(),
                    Value::String(text) => text.trim().parse::<f64>().ok(),
                    _ => None,
                };
                let Some(actual) = actual else {
                    return false;
                };
                match op {
                    CompareOp::Eq => actual == *expected,
                    CompareOp::Ne => actual != *expected,
                    CompareOp::Gt => actual > *expected,
                    CompareOp::Ge => actual >= *expected,
                    CompareOp::Lt => actual < *expected,
                    CompareOp::Le => actual <= *expected,
                }
            }
            (Comparison::IsTrue, Some(value)) => value == &Value::Bool(true),
            (Comparison::IsFalse, Some(value)) => value == &Value::Bool(false),
            (Comparison::IsNull, Some(value)) => value.is_null(),
        }
    }
}

fn resolve<'a>(document: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(document, |current, segment| match segment {
        PathSegment::Key(key) => current.get(key.as_str()),
        PathSegment::Index(index) => current.get(*index),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Selector(Vec<PathSegment>),
    Op(CompareOp),
    Text(String),
    Number(f64),
    Word(String),
    And,
    Or,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Selector(_) => "a selector".to_string(),
            Token::Op(op) => format!("operator '{}'", op.symbol()),
            Token::Text(text) => format!("string \"{text}\""),
            Token::Number(number) => format!("number {number}"),
            Token::Word(word) => format!("word '{word}'"),
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
        }
    }
}

fn parse_path(raw: &str) -> Result<Vec<PathSegment>, PatternError> {
    let bad = || PatternError::BadPath(raw.to_string());
    let mut rest = raw.strip_prefix('$').ok_or_else(bad)?;
    let mut segments = Vec::new();

    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            let end = after_dot.find(['.', '[']).unwrap_or(after_dot.len());
            let key = &after_dot[..end];
            if key.is_empty() {
                return Err(bad());
            }
            segments.push(PathSegment::Key(key.to_string()));
            rest = &after_dot[end..];
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let end = after_bracket.find(']').ok_or_else(bad)?;
            let index = after_bracket[..end].parse::<usize>().map_err(|_| bad())?;
            segments.push(PathSegment::Index(index));
            rest = &after_bracket[end + 1..];
        } else {
            return Err(bad());
        }
    }

    Ok(segments)
}

fn tokenize(source: &str) -> Result<Vec<Token>, PatternError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '$' => {
                let start = i;
                while i < chars.len() && !chars[i].is_whitespace() && !"=!<>&|".contains(chars[i])
                {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                tokens.push(Token::Selector(parse_path(&raw)?));
            }
            '"' => {
                i += 1;
                let mut text = String::new();
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '\\' if i + 1 < chars.len() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        '"' => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        other => {
                            text.push(other);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err(PatternError::UnterminatedQuote);
                }
                tokens.push(Token::Text(text));
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '>' | '<' => {
                let or_equal = chars.get(i + 1) == Some(&'=');
                let op = match (c, or_equal) {
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Le,
                    _ => CompareOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if or_equal { 2 } else { 1 };
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || ".eE+-".contains(chars[i]))
                {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number = raw.parse::<f64>().map_err(|_| PatternError::Expected {
                    expected: "a number",
                    found: raw.clone(),
                })?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Word(word.to_ascii_uppercase()));
            }
            other => return Err(PatternError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

impl JsonPattern {
    fn parse(inner: &str) -> Result<Self, PatternError> {
        let tokens = tokenize(inner)?;
        if tokens.is_empty() {
            return Err(PatternError::EmptySelector);
        }

        let mut tokens = tokens.into_iter().peekable();
        let mut groups = Vec::new();
        let mut current = Vec::new();

        loop {
            current.push(Self::parse_condition(&mut tokens)?);
            match tokens.next() {
                None => break,
                Some(Token::And) => continue,
                Some(Token::Or) => groups.push(std::mem::take(&mut current)),
                Some(other) => {
                    return Err(PatternError::Expected {
                        expected: "'&&' or '||'",
                        found: other.describe(),
                    });
                }
            }
        }
        groups.push(current);

        Ok(Self {
            any_of_groups: groups,
        })
    }

    fn parse_condition(
        tokens: &mut std::iter::Peekable<std::vec::IntoIter<Token>>,
    ) -> Result<Condition, PatternError> {
        let eof = || "end of selector".to_string();
        let path = match tokens.next() {
            Some(Token::Selector(path)) => path,
            other => {
                return Err(PatternError::Expected {
                    expected: "a $.selector",
                    found: other.map(|t| t.describe()).unwrap_or_else(eof),
                });
            }
        };

        let comparison = match tokens.next() {
            Some(Token::Op(op)) => match tokens.next() {
                Some(Token::Text(text)) => match op {
                    CompareOp::Eq | CompareOp::Ne => Comparison::Text {
                        negate: op == CompareOp::Ne,
                        matcher: TextMatcher::new(text)?,
                    },
                    ordering => return Err(PatternError::TextOrdering(ordering.symbol())),
                },
                Some(Token::Number(value)) => Comparison::Number { op, value },
                other => {
                    return Err(PatternError::Expected {
                        expected: "a string or number",
                        found: other.map(|t| t.describe()).unwrap_or_else(eof),
                    });
                }
            },
            Some(Token::Word(word)) if word == "IS" => match tokens.next() {
                Some(Token::Word(literal)) if literal == "TRUE" => Comparison::IsTrue,
                Some(Token::Word(literal)) if literal == "FALSE" => Comparison::IsFalse,
                Some(Token::Word(literal)) if literal == "NULL" => Comparison::IsNull,
                other => {
                    return Err(PatternError::Expected {
                        expected: "TRUE, FALSE or NULL after IS",
                        found: other.map(|t| t.describe()).unwrap_or_else(eof),
                    });
                }
            },
            Some(Token::Word(word)) if word == "NOT" => match tokens.next() {
                Some(Token::Word(exists)) if exists == "EXISTS" => Comparison::NotExists,
                other => {
                    return Err(PatternError::Expected {
                        expected: "EXISTS after NOT",
                        found: other.map(|t| t.describe()).unwrap_or_else(eof),
                    });
                }
            },
            other => {
                return Err(PatternError::Expected {
                    expected: "a comparison operator, IS or NOT EXISTS",
                    found: other.map(|t| t.describe()).unwrap_or_else(eof),
                });
            }
        };

        Ok(Condition { path, comparison })
    }

    fn matches(&self, text: &str) -> bool {
        let Ok(document) = serde_json::from_str::<Value>(text) else {
            return false;
        };
        self.any_of_groups
            .iter()
            .any(|group| group.iter().all(|condition| condition.evaluate(&document)))
    }
}
