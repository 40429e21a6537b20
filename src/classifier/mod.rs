//! Chi-squared combining spam classifier
//!
//! The Robinson scheme over per-token probabilities: each token's spam
//! probability is a Bayesian-adjusted count ratio, the strongest tokens
//! are combined through two chi-squared tail statistics, and the final
//! score is Hooft's `(S - H + 1) / 2` in `[0, 1]` with a genuinely useful
//! middle ground around 0.5.

pub mod chi2;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ApiError, AppResult};
use chi2::{chi2q, frexp};

const LN2: f64 = std::f64::consts::LN_2;

/// Probability assigned to never-seen tokens
const UNKNOWN_WORD_PROB: f64 = 0.5;
/// Weight of the unknown-word prior against observed counts
const UNKNOWN_WORD_STRENGTH: f64 = 0.45;
/// Tokens closer than this to 0.5 contribute no evidence
const MINIMUM_PROB_STRENGTH: f64 = 0.1;
/// At most this many extreme tokens are combined per message
const MAX_DISCRIMINATORS: usize = 150;

/// Per-token training counts
///
/// Invariant: a stored record has `spam_count + ham_count > 0`; records
/// that decay to zero evidence are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WordInfo {
    pub spam_count: f64,
    pub ham_count: f64,
}

/// The trainable classifier state
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    words: HashMap<String, WordInfo>,
    /// Messages trained as spam
    pub nspam: i64,
    /// Messages trained as ham
    pub nham: i64,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct tokens with evidence
    pub fn token_count(&self) -> usize {
        self.words.len()
    }

    /// `P(spam | token)` with Robinson's Bayesian adjustment:
    /// `(S·x + n·p) / (S + n)`
    fn probability(&self, info: &WordInfo) -> f64 {
        let nham = (self.nham.max(1)) as f64;
        let nspam = (self.nspam.max(1)) as f64;

        // decay() rounding can push counts above the message totals
        let spam_count = info.spam_count.min(nspam);
        let ham_count = info.ham_count.min(nham);

        let ham_ratio = ham_count / nham;
        let spam_ratio = spam_count / nspam;
        let p = spam_ratio / (ham_ratio + spam_ratio);

        let n = spam_count + ham_count;
        (UNKNOWN_WORD_STRENGTH * UNKNOWN_WORD_PROB + n * p) / (UNKNOWN_WORD_STRENGTH + n)
    }

    /// The strongest clues for a message: up to 150 tokens whose
    /// probability is at least 0.1 away from neutral
    fn clues<'a, I: IntoIterator<Item = &'a str>>(&self, tokens: I) -> Vec<f64> {
        let mut seen = std::collections::HashSet::new();
        let mut scored: Vec<(f64, f64)> = Vec::new();
        for token in tokens {
            if !seen.insert(token) {
                continue;
            }
            let prob = match self.words.get(token) {
                Some(info) => self.probability(info),
                None => UNKNOWN_WORD_PROB,
            };
            let distance = (prob - 0.5).abs();
            if distance >= MINIMUM_PROB_STRENGTH {
                scored.push((distance, prob));
            }
        }
        scored.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        if scored.len() > MAX_DISCRIMINATORS {
            scored.drain(..scored.len() - MAX_DISCRIMINATORS);
        }
        scored.into_iter().map(|(_, p)| p).collect()
    }

    /// Best-guess probability that the token stream is spam, in `[0, 1]`
    pub fn classify<'a, I: IntoIterator<Item = &'a str>>(&self, tokens: I) -> f64 {
        // Two chi-squared statistics: the spam measure uses 1-p so
        // high-spamprob tokens weigh most, the ham measure uses p. The
        // products are kept in (mantissa, exponent) form to survive
        // hundreds of factors without underflow.
        let mut h = 1.0f64;
        let mut s = 1.0f64;
        let mut h_exp = 0i32;
        let mut s_exp = 0i32;

        let clues = self.clues(tokens);
        for prob in &clues {
            let prob = prob.clamp(1e-10, 1.0 - 1e-10);
            s *= 1.0 - prob;
            h *= prob;
            if s < 1e-200 {
                let (m, e) = frexp(s);
                s = m;
                s_exp += e;
            }
            if h < 1e-200 {
                let (m, e) = frexp(h);
                h = m;
                h_exp += e;
            }
        }

        let n = clues.len();
        if n == 0 {
            return 0.5;
        }
        let s_ln = s.ln() + f64::from(s_exp) * LN2;
        let h_ln = h.ln() + f64::from(h_exp) * LN2;
        let s_stat = 1.0 - chi2q(-2.0 * s_ln, 2 * n as u32);
        let h_stat = 1.0 - chi2q(-2.0 * h_ln, 2 * n as u32);
        (s_stat - h_stat + 1.0) / 2.0
    }

    /// Teach the classifier one message
    ///
    /// Each distinct token counts once per message, however often it
    /// repeats inside it.
    pub fn learn<'a, I: IntoIterator<Item = &'a str>>(&mut self, tokens: I, is_spam: bool) {
        if is_spam {
            self.nspam += 1;
        } else {
            self.nham += 1;
        }
        let unique: std::collections::HashSet<&str> = tokens.into_iter().collect();
        for token in unique {
            let info = self.words.entry(token.to_owned()).or_default();
            if is_spam {
                info.spam_count += 1.0;
            } else {
                info.ham_count += 1.0;
            }
        }
    }

    /// Undo a prior [`Classifier::learn`] call (pilot error recovery)
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the corpus counter would go negative.
    pub fn unlearn<'a, I: IntoIterator<Item = &'a str>>(
        &mut self,
        tokens: I,
        is_spam: bool,
    ) -> AppResult<()> {
        if is_spam {
            if self.nspam <= 0 {
                return Err(ApiError::invalid("spam count would go negative"));
            }
            self.nspam -= 1;
        } else {
            if self.nham <= 0 {
                return Err(ApiError::invalid("ham count would go negative"));
            }
            self.nham -= 1;
        }
        let unique: std::collections::HashSet<&str> = tokens.into_iter().collect();
        for token in unique {
            let mut drained = false;
            if let Some(info) = self.words.get_mut(token) {
                if is_spam {
                    info.spam_count = (info.spam_count - 1.0).max(0.0);
                } else {
                    info.ham_count = (info.ham_count - 1.0).max(0.0);
                }
                drained = info.spam_count == 0.0 && info.ham_count == 0.0;
            }
            if drained {
                self.words.remove(token);
            }
        }
        Ok(())
    }

    /// Scale every count by `1 - ratio`, dropping tokens whose evidence
    /// falls below half a message; returns how many tokens were dropped
    pub fn decay(&mut self, ratio: f64) -> usize {
        let scale = 1.0 - ratio;
        let before = self.words.len();
        for info in self.words.values_mut() {
            info.spam_count *= scale;
            info.ham_count *= scale;
        }
        self.words
            .retain(|_, info| info.spam_count >= 0.5 || info.ham_count >= 0.5);
        self.nspam = (scale * self.nspam as f64) as i64;
        self.nham = (scale * self.nham as f64) as i64;
        before - self.words.len()
    }

    /// Serialize as `(token, spam_count, ham_count)` triples
    ///
    /// The special token `*` carries the corpus totals and comes first.
    pub fn dump(&self) -> Vec<(String, f64, f64)> {
        let mut rows = Vec::with_capacity(self.words.len() + 1);
        rows.push(("*".to_owned(), self.nspam as f64, self.nham as f64));
        let mut words: Vec<_> = self.words.iter().collect();
        words.sort_by(|a, b| a.0.cmp(b.0));
        for (token, info) in words {
            rows.push((token.clone(), info.spam_count, info.ham_count));
        }
        rows
    }

    /// Rebuild a classifier from serialized triples
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the `*` totals row is missing.
    pub fn load(rows: impl IntoIterator<Item = (String, f64, f64)>) -> AppResult<Self> {
        let mut classifier = Self::new();
        let mut saw_totals = false;
        for (token, spam_count, ham_count) in rows {
            if token == "*" {
                classifier.nspam = spam_count as i64;
                classifier.nham = ham_count as i64;
                saw_totals = true;
            } else {
                classifier
                    .words
                    .insert(token, WordInfo { spam_count, ham_count });
            }
        }
        if !saw_totals {
            return Err(ApiError::invalid("classifier dump without totals row"));
        }
        Ok(classifier)
    }
}
