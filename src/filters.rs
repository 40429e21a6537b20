//! Filter-script engine and autotaggers
//!
//! Incoming messages run through a user-supplied filter script that
//! mutates the message's keyword set. Scripts are written in a small
//! line-oriented language compiled to an AST at registration time; a
//! script that does not compile is rejected outright, a script that fails
//! at runtime skips the message (the caller decides what to do with it).
//!
//! ```text
//! add_tags "unread" "inbox"
//! if keyword "status:o" { remove_tag "unread" }
//! run_autotagger "spam"
//! if tag "spam" { remove_tag "inbox" }
//! run_autotagger
//! ```
//!
//! Tag statements follow the `in:` prefix discipline: `add_tag "inbox"`
//! is exactly `add_keyword "in:inbox"`.
//!
//! Autotaggers wrap the chi-squared classifier with a tag, a confidence
//! threshold and a minimum-corpus gate; an undertrained autotagger
//! declines to classify and returns the neutral score.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::Classifier;
use crate::errors::{ApiError, AppResult};
use crate::storage::metadata::Metadata;

/// The filter every new message runs through unless configured otherwise
pub const DEFAULT_NEW_FILTER_SCRIPT: &str = r#"
# By default, treat new messages as unread, add to Inbox
add_tags "unread" "inbox"

if keyword "status:o" { remove_tag "unread" }

# Check if we think the message is spam
run_autotagger "spam"
if tag "spam" { remove_tag "inbox" }

# Run the rest of the autotaggers
run_autotagger
"#;

/// Autotaggers refuse to classify below this many training messages
const MIN_CORPUS: i64 = 100;

// -- autotaggers ----------------------------------------------------------

/// Serialized autotagger shape
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AutoTaggerState {
    tag: String,
    spam_ids: Vec<u64>,
    ham_ids: Vec<u64>,
    threshold: f64,
    training_auto: bool,
    trained_version: u64,
    classifier: String,
    data: Vec<(String, f64, f64)>,
}

/// A named classifier instance bound to one tag
#[derive(Debug, Clone)]
pub struct AutoTagger {
    pub tag: String,
    /// Metadata keys this instance was trained on, for retraining
    pub spam_ids: Vec<u64>,
    pub ham_ids: Vec<u64>,
    /// Scores above this add the tag
    pub threshold: f64,
    pub training_auto: bool,
    pub trained_version: u64,
    classifier: Classifier,
    /// Set in tests to exercise small corpora
    min_corpus: i64,
}

impl AutoTagger {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            spam_ids: Vec::new(),
            ham_ids: Vec::new(),
            threshold: 0.9,
            training_auto: true,
            trained_version: 0,
            classifier: Classifier::new(),
            min_corpus: MIN_CORPUS,
        }
    }

    #[cfg(test)]
    fn with_min_corpus(mut self, min_corpus: i64) -> Self {
        self.min_corpus = min_corpus;
        self
    }

    /// Train one example into the underlying classifier
    pub fn learn<'a, I: IntoIterator<Item = &'a str>>(&mut self, tokens: I, is_spam: bool) {
        self.classifier.learn(tokens, is_spam);
        self.trained_version += 1;
    }

    /// Score a token stream; undertrained instances return neutral 0.5
    pub fn classify<'a, I: IntoIterator<Item = &'a str>>(&self, tokens: I) -> f64 {
        if self.classifier.nspam + self.classifier.nham < self.min_corpus {
            return 0.5;
        }
        self.classifier.classify(tokens)
    }

    /// Apply a decay pass to the underlying counts
    pub fn decay(&mut self, ratio: f64) -> usize {
        self.classifier.decay(ratio)
    }

    pub fn to_json(&self) -> AppResult<String> {
        let state = AutoTaggerState {
            tag: self.tag.clone(),
            spam_ids: self.spam_ids.clone(),
            ham_ids: self.ham_ids.clone(),
            threshold: self.threshold,
            training_auto: self.training_auto,
            trained_version: self.trained_version,
            classifier: "spambayes".to_owned(),
            data: self.classifier.dump(),
        };
        Ok(serde_json::to_string(&state)?)
    }

    pub fn from_json(raw: &str) -> AppResult<Self> {
        let state: AutoTaggerState = serde_json::from_str(raw)?;
        if state.classifier != "spambayes" {
            return Err(ApiError::invalid(format!(
                "unknown classifier type '{}'",
                state.classifier
            )));
        }
        Ok(Self {
            tag: state.tag,
            spam_ids: state.spam_ids,
            ham_ids: state.ham_ids,
            threshold: state.threshold,
            training_auto: state.training_auto,
            trained_version: state.trained_version,
            classifier: Classifier::load(state.data)?,
            min_corpus: MIN_CORPUS,
        })
    }
}

// -- the filter language --------------------------------------------------

#[derive(Debug, Clone)]
enum Cond {
    Keyword(String),
    Tag(String),
    Header(String, Regex),
    OlderThan(i64),
    Not(Box<Cond>),
    All(Vec<Cond>),
    Any(Vec<Cond>),
}

#[derive(Debug, Clone)]
enum Stmt {
    AddKeywords(Vec<String>),
    RemoveKeywords(Vec<String>),
    AddTags(Vec<String>),
    RemoveTags(Vec<String>),
    RunAutotagger(Option<String>),
    Stop,
    If {
        cond: Cond,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    OpenBrace,
    CloseBrace,
    OpenParen,
    CloseParen,
    Comma,
    Tilde,
}

fn tokenize(script: &str) -> AppResult<Vec<Token>> {
    let mut tokens = Vec::new();
    for line in script.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                ' ' | '\t' => {}
                '{' => tokens.push(Token::OpenBrace),
                '}' => tokens.push(Token::CloseBrace),
                '(' => tokens.push(Token::OpenParen),
                ')' => tokens.push(Token::CloseParen),
                ',' => tokens.push(Token::Comma),
                '~' => tokens.push(Token::Tilde),
                '"' => {
                    let mut value = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '"' {
                            closed = true;
                            break;
                        }
                        value.push(c);
                    }
                    if !closed {
                        return Err(ApiError::FilterScript("Compile failed".to_owned()));
                    }
                    tokens.push(Token::Str(value));
                }
                c if c.is_alphanumeric() || c == '_' || c == ':' || c == '-' => {
                    let mut ident = String::from(c);
                    while let Some(&next) = chars.peek() {
                        if next.is_alphanumeric() || next == '_' || next == ':' || next == '-' {
                            ident.push(next);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push(Token::Ident(ident));
                }
                _ => return Err(ApiError::FilterScript("Compile failed".to_owned())),
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn fail<T>() -> AppResult<T> {
        Err(ApiError::FilterScript("Compile failed".to_owned()))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: &Token) -> AppResult<()> {
        if self.next().as_ref() == Some(token) {
            Ok(())
        } else {
            Self::fail()
        }
    }

    fn string(&mut self) -> AppResult<String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            _ => Self::fail(),
        }
    }

    /// One or more string arguments
    fn string_list(&mut self) -> AppResult<Vec<String>> {
        let mut items = Vec::new();
        while let Some(Token::Str(_)) = self.peek() {
            items.push(self.string()?);
        }
        if items.is_empty() {
            return Self::fail();
        }
        Ok(items)
    }

    fn block(&mut self) -> AppResult<Vec<Stmt>> {
        self.expect(&Token::OpenBrace)?;
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Some(Token::CloseBrace) => {
                    self.next();
                    return Ok(body);
                }
                Some(_) => body.push(self.statement()?),
                None => return Self::fail(),
            }
        }
    }

    fn condition(&mut self) -> AppResult<Cond> {
        match self.next() {
            Some(Token::Ident(word)) => match word.as_str() {
                "not" => Ok(Cond::Not(Box::new(self.condition()?))),
                "keyword" => Ok(Cond::Keyword(self.string()?)),
                "tag" => Ok(Cond::Tag(self.string()?)),
                "header" => {
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        _ => return Self::fail(),
                    };
                    self.expect(&Token::Tilde)?;
                    let pattern = self.string()?;
                    let regex = Regex::new(&pattern)
                        .map_err(|_| ApiError::FilterScript("Compile failed".to_owned()))?;
                    Ok(Cond::Header(name.to_ascii_lowercase(), regex))
                }
                "older_than" => {
                    let spec = match self.next() {
                        Some(Token::Ident(spec)) => spec,
                        _ => return Self::fail(),
                    };
                    Ok(Cond::OlderThan(parse_duration(&spec)?))
                }
                "all" | "any" => {
                    self.expect(&Token::OpenParen)?;
                    let mut conds = Vec::new();
                    loop {
                        conds.push(self.condition()?);
                        match self.next() {
                            Some(Token::Comma) => {}
                            Some(Token::CloseParen) => break,
                            _ => return Self::fail(),
                        }
                    }
                    if word == "all" {
                        Ok(Cond::All(conds))
                    } else {
                        Ok(Cond::Any(conds))
                    }
                }
                _ => Self::fail(),
            },
            _ => Self::fail(),
        }
    }

    fn statement(&mut self) -> AppResult<Stmt> {
        match self.next() {
            Some(Token::Ident(word)) => match word.as_str() {
                "add_tag" | "add_tags" => Ok(Stmt::AddTags(self.string_list()?)),
                "remove_tag" | "remove_tags" => Ok(Stmt::RemoveTags(self.string_list()?)),
                "add_keyword" | "add_keywords" => Ok(Stmt::AddKeywords(self.string_list()?)),
                "remove_keyword" | "remove_keywords" => {
                    Ok(Stmt::RemoveKeywords(self.string_list()?))
                }
                "run_autotagger" => {
                    let name = match self.peek() {
                        Some(Token::Str(_)) => Some(self.string()?),
                        _ => None,
                    };
                    Ok(Stmt::RunAutotagger(name))
                }
                "stop" => Ok(Stmt::Stop),
                "if" => {
                    let cond = self.condition()?;
                    let then = self.block()?;
                    let otherwise = if self.peek() == Some(&Token::Ident("else".to_owned())) {
                        self.next();
                        self.block()?
                    } else {
                        Vec::new()
                    };
                    Ok(Stmt::If {
                        cond,
                        then,
                        otherwise,
                    })
                }
                _ => Self::fail(),
            },
            _ => Self::fail(),
        }
    }
}

/// Parse friendly durations like `90s`, `30M`, `12h`, `7d`, `2w` into seconds
fn parse_duration(spec: &str) -> AppResult<i64> {
    let (number, unit) = spec.split_at(spec.len().saturating_sub(1));
    let multiplier = match unit {
        "s" => 1,
        "M" => 60,
        "h" | "H" => 3600,
        "d" => 86_400,
        "w" => 7 * 86_400,
        _ => {
            // A bare number is seconds
            return spec
                .parse()
                .map_err(|_| ApiError::FilterScript("Compile failed".to_owned()));
        }
    };
    number
        .parse::<i64>()
        .map(|n| n * multiplier)
        .map_err(|_| ApiError::FilterScript("Compile failed".to_owned()))
}

/// Everything a running filter script may look at
pub struct FilterContext<'a> {
    pub metadata: &'a Metadata,
    /// Raw message headers, for `header X ~ "re"` conditions
    pub headers: &'a str,
    /// Wall clock, for `older_than`
    pub now: i64,
    pub autotaggers: &'a BTreeMap<String, AutoTagger>,
}

impl FilterContext<'_> {
    /// Token stream handed to autotaggers
    fn tokens(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        for source in [
            &self.metadata.subject,
            &self.metadata.from,
            &self.metadata.snippet,
        ] {
            tokens.extend(
                source
                    .split_whitespace()
                    .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
                    .filter(|w| !w.is_empty()),
            );
        }
        tokens
    }
}

/// A compiled filter script
#[derive(Debug)]
pub struct FilterEngine {
    program: Vec<Stmt>,
}

impl FilterEngine {
    /// Compile a script, or the default script when `None`
    ///
    /// # Errors
    ///
    /// `FilterScript("Compile failed")` on any syntax error; a broken
    /// script never registers.
    pub fn compile(script: Option<&str>) -> AppResult<Self> {
        let raw = script.unwrap_or(DEFAULT_NEW_FILTER_SCRIPT);
        let mut parser = Parser {
            tokens: tokenize(raw)?,
            pos: 0,
        };
        let mut program = Vec::new();
        while parser.peek().is_some() {
            program.push(parser.statement()?);
        }
        Ok(Self { program })
    }

    /// Run the script over a keyword set
    ///
    /// On success the mutated set is the message's new tag set. On a
    /// runtime error the set is left as the script made it so far and the
    /// error is returned; the caller decides whether to drop the message
    /// or queue it for review.
    pub fn filter(
        &self,
        keywords: &mut BTreeSet<String>,
        ctx: &FilterContext<'_>,
    ) -> AppResult<()> {
        let mut autotag_done = BTreeSet::new();
        match self.run_block(&self.program, keywords, ctx, &mut autotag_done) {
            Ok(_) | Err(StopSignal::Stop) => Ok(()),
            Err(StopSignal::Failed(message)) => Err(ApiError::FilterScript(message)),
        }
    }

    fn run_block(
        &self,
        block: &[Stmt],
        keywords: &mut BTreeSet<String>,
        ctx: &FilterContext<'_>,
        autotag_done: &mut BTreeSet<String>,
    ) -> Result<(), StopSignal> {
        for stmt in block {
            match stmt {
                Stmt::AddKeywords(words) => {
                    for word in words {
                        keywords.insert(word.to_lowercase());
                    }
                }
                Stmt::RemoveKeywords(words) => {
                    for word in words {
                        keywords.remove(&word.to_lowercase());
                    }
                }
                Stmt::AddTags(tags) => {
                    for tag in tags {
                        keywords.insert(format!("in:{}", tag.to_lowercase()));
                    }
                }
                Stmt::RemoveTags(tags) => {
                    // Removing a tag that is not set is a script bug
                    for tag in tags {
                        let keyword = format!("in:{}", tag.to_lowercase());
                        if !keywords.remove(&keyword) {
                            return Err(StopSignal::Failed(format!(
                                "tag '{tag}' is not set"
                            )));
                        }
                    }
                }
                Stmt::RunAutotagger(name) => {
                    let selected: Vec<&AutoTagger> = match name {
                        Some(name) => ctx.autotaggers.get(name).into_iter().collect(),
                        None => ctx.autotaggers.values().collect(),
                    };
                    let tokens = ctx.tokens();
                    for tagger in selected {
                        if !autotag_done.insert(tagger.tag.clone()) {
                            continue;
                        }
                        let score =
                            tagger.classify(tokens.iter().map(String::as_str));
                        debug!(tag = tagger.tag, score, "autotagger ran");
                        if score > tagger.threshold {
                            keywords.insert(format!("in:{}", tagger.tag));
                        }
                    }
                }
                Stmt::Stop => return Err(StopSignal::Stop),
                Stmt::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    let branch = if self.eval(cond, keywords, ctx) {
                        then
                    } else {
                        otherwise
                    };
                    self.run_block(branch, keywords, ctx, autotag_done)?;
                }
            }
        }
        Ok(())
    }

    fn eval(&self, cond: &Cond, keywords: &BTreeSet<String>, ctx: &FilterContext<'_>) -> bool {
        match cond {
            Cond::Keyword(word) => keywords.contains(&word.to_lowercase()),
            Cond::Tag(tag) => keywords.contains(&format!("in:{}", tag.to_lowercase())),
            Cond::Header(name, regex) => ctx
                .headers
                .lines()
                .filter_map(|line| line.split_once(':'))
                .any(|(header, value)| {
                    header.trim().eq_ignore_ascii_case(name) && regex.is_match(value.trim())
                }),
            Cond::OlderThan(secs) => ctx.metadata.timestamp < ctx.now - secs,
            Cond::Not(inner) => !self.eval(inner, keywords, ctx),
            Cond::All(conds) => conds.iter().all(|c| self.eval(c, keywords, ctx)),
            Cond::Any(conds) => conds.iter().any(|c| self.eval(c, keywords, ctx)),
        }
    }
}

enum StopSignal {
    Stop,
    Failed(String),
}
