// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Selection rule language.
//!
//! ```text
//! rules       := rule { ";" rule } [ ";" ]
//! rule        := "FOR" product_type "SELECT" policy { "OR" policy }
//!                [ "MINCOVER" "(" percent ")" ] [ "MANDATORY" | "OPTIONAL" ]
//! policy      := name [ "(" delta "," delta ")" ]
//! delta       := integer [ "D" | "H" | "M" | "S" ]
//! ```
//!
//! Keywords and units are case-insensitive. A delta without a unit is in
//! days. A rule without a requirement keyword is mandatory.

use std::fmt;

use chrono::Duration;

use crate::error::{CoreError, Result};

/// Supported selection policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// Every candidate intersecting the window.
    ValIntersect,
    /// The most recently generated candidate intersecting the window.
    LatestValIntersect,
    /// The candidate with the latest sensing start, regardless of window.
    LatestValidity,
    /// The most recently generated candidate covering the whole window.
    LatestValCover,
    /// The candidate whose sensing start is closest to the window centre.
    LatestValidityClosest,
}

/// Policy names of the rule language that this planner does not evaluate.
const UNSUPPORTED_POLICIES: &[&str] = &[
    "VALCOVER",
    "BESTCENTEREDCOVER",
    "LATESTVALCOVERCLOSEST",
    "LARGESTOVERLAP",
    "LARGESTOVERLAP85",
    "LATESTVALCOVERNEWESTVALIDITY",
];

impl PolicyKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ValIntersect => "ValIntersect",
            Self::LatestValIntersect => "LatestValIntersect",
            Self::LatestValidity => "LatestValidity",
            Self::LatestValCover => "LatestValCover",
            Self::LatestValidityClosest => "LatestValidityClosest",
        }
    }

    fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "VALINTERSECT" => Some(Self::ValIntersect),
            "LATESTVALINTERSECT" => Some(Self::LatestValIntersect),
            "LATESTVALIDITY" => Some(Self::LatestValidity),
            "LATESTVALCOVER" => Some(Self::LatestValCover),
            "LATESTVALIDITYCLOSEST" => Some(Self::LatestValidityClosest),
            _ => None,
        }
    }
}

/// One policy with its window extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub kind: PolicyKind,
    /// Subtracted from the window start.
    pub delta_before: Duration,
    /// Added to the window stop.
    pub delta_after: Duration,
}

impl SelectionPolicy {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            delta_before: Duration::zero(),
            delta_after: Duration::zero(),
        }
    }

    pub fn with_deltas(mut self, before: Duration, after: Duration) -> Self {
        self.delta_before = before;
        self.delta_after = after;
        self
    }
}

/// Input requirement for one product type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRule {
    pub product_type: String,
    /// Tried in order; the first policy yielding a non-empty set wins.
    pub policies: Vec<SelectionPolicy>,
    pub mandatory: bool,
    /// Minimum percentage of the window the selection must cover.
    pub min_coverage: Option<u8>,
}

impl SelectionRule {
    /// Parse a rule text holding zero or more rules.
    pub fn parse(text: &str) -> Result<Vec<SelectionRule>> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            text,
            tokens,
            pos: 0,
        };
        parser.rules()
    }
}

impl fmt::Display for SelectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FOR {} SELECT ", self.product_type)?;
        for (i, policy) in self.policies.iter().enumerate() {
            if i > 0 {
                f.write_str(" OR ")?;
            }
            write!(
                f,
                "{}({} S, {} S)",
                policy.kind.name(),
                policy.delta_before.num_seconds(),
                policy.delta_after.num_seconds()
            )?;
        }
        if let Some(percent) = self.min_coverage {
            write!(f, " MINCOVER({})", percent)?;
        }
        f.write_str(if self.mandatory { " MANDATORY" } else { " OPTIONAL" })
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    LParen,
    RParen,
    Comma,
    Semicolon,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        let tok = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            ',' => Tok::Comma,
            ';' => Tok::Semicolon,
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if !is_word_char(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token {
                    tok: Tok::Word(word),
                    offset,
                });
                continue;
            }
            other => {
                return Err(syntax(text, offset, format!("unexpected character '{}'", other)));
            }
        };
        chars.next();
        tokens.push(Token { tok, offset });
    }

    Ok(tokens)
}

fn syntax(text: &str, position: usize, message: impl Into<String>) -> CoreError {
    CoreError::RuleSyntax {
        rule: text.to_string(),
        position,
        message: message.into(),
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.offset)
            .unwrap_or(self.text.len())
    }

    fn error(&self, message: impl Into<String>) -> CoreError {
        syntax(self.text, self.offset(), message)
    }

    fn next_word(&mut self, what: &str) -> Result<String> {
        match self.peek() {
            Some(Tok::Word(w)) => {
                let w = w.clone();
                self.pos += 1;
                Ok(w)
            }
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Tok::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", keyword)))
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<()> {
        if self.peek() == Some(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn rules(&mut self) -> Result<Vec<SelectionRule>> {
        let mut rules = Vec::new();
        while self.peek().is_some() {
            rules.push(self.rule()?);
            match self.peek() {
                Some(Tok::Semicolon) => self.pos += 1,
                None => break,
                Some(_) => return Err(self.error("expected ';' or end of rule")),
            }
        }
        Ok(rules)
    }

    fn rule(&mut self) -> Result<SelectionRule> {
        self.expect_keyword("FOR")?;
        let product_type = self.next_word("product type")?;
        self.expect_keyword("SELECT")?;

        let mut policies = vec![self.policy()?];
        while self.peek_keyword("OR") {
            self.pos += 1;
            policies.push(self.policy()?);
        }

        let mut min_coverage = None;
        let mut mandatory = None;
        loop {
            if self.peek_keyword("MINCOVER") && min_coverage.is_none() {
                self.pos += 1;
                self.expect(Tok::LParen, "'('")?;
                let offset = self.offset();
                let value = self.next_word("coverage percentage")?;
                let percent = value
                    .parse::<u8>()
                    .ok()
                    .filter(|p| *p <= 100)
                    .ok_or_else(|| syntax(self.text, offset, "coverage must be 0..=100"))?;
                self.expect(Tok::RParen, "')'")?;
                min_coverage = Some(percent);
            } else if self.peek_keyword("MANDATORY") && mandatory.is_none() {
                self.pos += 1;
                mandatory = Some(true);
            } else if self.peek_keyword("OPTIONAL") && mandatory.is_none() {
                self.pos += 1;
                mandatory = Some(false);
            } else {
                break;
            }
        }

        Ok(SelectionRule {
            product_type,
            policies,
            mandatory: mandatory.unwrap_or(true),
            min_coverage,
        })
    }

    fn policy(&mut self) -> Result<SelectionPolicy> {
        let offset = self.offset();
        let name = self.next_word("policy name")?;
        let kind = PolicyKind::lookup(&name).ok_or_else(|| {
            if UNSUPPORTED_POLICIES.contains(&name.to_ascii_uppercase().as_str()) {
                syntax(self.text, offset, format!("policy '{}' is not supported", name))
            } else {
                syntax(self.text, offset, format!("unknown policy '{}'", name))
            }
        })?;

        let mut policy = SelectionPolicy::new(kind);
        if self.peek() == Some(&Tok::LParen) {
            self.pos += 1;
            let before = self.delta()?;
            self.expect(Tok::Comma, "','")?;
            let after = self.delta()?;
            self.expect(Tok::RParen, "')'")?;
            policy = policy.with_deltas(before, after);
        }
        Ok(policy)
    }

    /// `12 H`, `12H` or a bare `12` (days).
    fn delta(&mut self) -> Result<Duration> {
        let offset = self.offset();
        let word = self.next_word("time delta")?;
        let split = word
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(word.len());
        let (digits, suffix) = word.split_at(split);
        let amount: i64 = digits
            .parse()
            .map_err(|_| syntax(self.text, offset, "time delta must start with a number"))?;

        let unit = if !suffix.is_empty() {
            suffix.to_string()
        } else {
            match self.peek() {
                Some(Tok::Word(w)) if unit_duration(w, 1).is_some() => {
                    let w = w.clone();
                    self.pos += 1;
                    w
                }
                _ => "D".to_string(),
            }
        };

        unit_duration(&unit, amount)
            .ok_or_else(|| syntax(self.text, offset, format!("unknown time unit '{}'", unit)))
    }
}

fn unit_duration(unit: &str, amount: i64) -> Option<Duration> {
    match unit.to_ascii_uppercase().as_str() {
        "D" => Some(Duration::days(amount)),
        "H" => Some(Duration::hours(amount)),
        "M" => Some(Duration::minutes(amount)),
        "S" => Some(Duration::seconds(amount)),
        _ => None,
    }
}
