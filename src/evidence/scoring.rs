use regex::Regex;

use crate::model::MatchClass;
use crate::similarity::{partial_ratio, token_sort_ratio};
use crate::util::truncate_chars;

/// Excerpt cap; also the length at which the length bonus saturates.
pub const QUAL_MAX_CHARS: usize = 1000;
const PROXY_THRESHOLD: f64 = 60.0;
const MIN_SENTENCE_CHARS: usize = 30;

const TIER_SHARE: f64 = 0.7;
const FUZZY_SHARE: f64 = 0.2;
const LENGTH_SHARE: f64 = 0.1;

/// Deterministic candidate scoring against a concept's construct terms.
#[derive(Debug, Clone)]
pub struct CandidateScorer {
    sentence_break: Regex,
}

impl CandidateScorer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            sentence_break: Regex::new(r"[.!?]\s+|\n+")?,
        })
    }

    /// `0.7 * tier_weight + 0.2 * token_sort_ratio + 0.1 * length_bonus`, in `[0, 1]`.
    pub fn score(&self, terms: &[String], text: &str) -> (f64, MatchClass) {
        let match_class = classify_match(terms, text);
        let fuzzy = if terms.is_empty() {
            0.0
        } else {
            token_sort_ratio(&terms.join(" "), &text.to_lowercase()) / 100.0
        };
        let length_bonus =
            text.chars().count().min(QUAL_MAX_CHARS) as f64 / QUAL_MAX_CHARS as f64;
        let score =
            TIER_SHARE * match_class.tier_weight() + FUZZY_SHARE * fuzzy + LENGTH_SHARE * length_bonus;
        (score, match_class)
    }

    /// Picks the best-scoring sentence that mentions a construct term. Without such a sentence
    /// the first substantial line is used and classed `proxy` (or `none` when there are no terms).
    pub fn best_sentence(&self, text: &str, terms: &[String]) -> (String, MatchClass) {
        let sentences = self.split_sentences(text);

        let mut best: Option<(&str, f64, MatchClass)> = None;
        for sentence in sentences.iter().copied() {
            if !is_substantial(sentence) {
                continue;
            }
            let lower = sentence.to_lowercase();
            if !terms.is_empty() && !terms.iter().any(|term| lower.contains(term.as_str())) {
                continue;
            }
            let (score, match_class) = self.score(terms, sentence);
            if best.is_none_or(|(_, best_score, _)| score > best_score) {
                best = Some((sentence, score, match_class));
            }
        }

        if let Some((sentence, _, match_class)) = best {
            return (truncate_chars(sentence, QUAL_MAX_CHARS).to_string(), match_class);
        }

        let fallback_class = if terms.is_empty() {
            MatchClass::None
        } else {
            MatchClass::Proxy
        };
        let fallback = sentences
            .iter()
            .copied()
            .find(|sentence| is_substantial(sentence))
            .or_else(|| sentences.iter().copied().find(|sentence| !sentence.is_empty()));

        match fallback {
            Some(sentence) => (
                truncate_chars(sentence, QUAL_MAX_CHARS).to_string(),
                fallback_class,
            ),
            None => (String::new(), MatchClass::None),
        }
    }

    /// Splits after `.`, `!` or `?` followed by whitespace, and on newlines. Terminal
    /// punctuation stays with its sentence.
    fn split_sentences<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut sentences = Vec::new();
        let mut start = 0usize;
        for found in self.sentence_break.find_iter(text) {
            let matched = found.as_str();
            let end = if matched.starts_with(['.', '!', '?']) {
                found.start() + 1
            } else {
                found.start()
            };
            sentences.push(text[start..end].trim());
            start = found.end();
        }
        sentences.push(text[start..].trim());
        sentences
    }
}

pub fn classify_match(terms: &[String], text: &str) -> MatchClass {
    if text.trim().is_empty() || terms.is_empty() {
        return MatchClass::None;
    }
    let lower = text.to_lowercase();
    if terms.iter().all(|term| lower.contains(term.as_str())) {
        return MatchClass::Exact;
    }
    if terms.iter().any(|term| lower.contains(term.as_str())) {
        return MatchClass::Behavior;
    }
    if partial_ratio(&terms.join(" "), &lower) >= PROXY_THRESHOLD {
        return MatchClass::Proxy;
    }
    MatchClass::None
}

/// Entry relevance before finalisation: `clamp(base + 0.25 * score, 0.10, 0.99)`, 2 dp.
pub fn entry_relevance(score: f64, match_class: MatchClass) -> f64 {
    let relevance = match_class.base_relevance() + 0.25 * score.clamp(0.0, 1.0);
    crate::util::round_to(relevance.clamp(0.10, 0.99), 2)
}

fn is_substantial(sentence: &str) -> bool {
    sentence.chars().count() >= MIN_SENTENCE_CHARS && !is_all_caps(sentence) && !sentence.ends_with(':')
}

fn is_all_caps(sentence: &str) -> bool {
    let mut has_cased = false;
    for character in sentence.chars() {
        if character.is_lowercase() {
            return false;
        }
        if character.is_uppercase() {
            has_cased = true;
        }
    }
    has_cased
}
