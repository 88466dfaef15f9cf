//! Transcript acceptance filter
//!
//! Speech-to-text models tend to emit a handful of stock phrases when fed
//! silence or noise. Fixed-interval chunking also means adjacent chunks can
//! overlap the same words. This filter rejects both, plus single-word
//! fragments too short to carry meaning.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::time::Instant;

use super::Transcript;

/// Phrases commonly hallucinated on silent or noisy input
const DEFAULT_DENY_PHRASES: &[&str] = &[
    "thank you",
    "thank you very much",
    "thank you so much",
    "thanks",
    "thanks for watching",
    "thank you for watching",
    "thanks for listening",
    "please subscribe",
    "subscribe",
    "like and subscribe",
    "dont forget to subscribe",
    "subtitles by the amaraorg community",
    "bye",
    "bye bye",
    "you",
    "okay",
    "hmm",
    "uh",
    "um",
];

/// Phrases at least this long tolerate a one-character difference
const NEAR_MATCH_MIN_CHARS: usize = 6;

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").expect("valid regex"));

/// Filter tuning
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Identical transcripts within this window are dropped
    pub duplicate_window: Duration,
    /// Single-word transcripts shorter than this are dropped
    pub min_chars: usize,
    /// Extra phrases appended to the built-in deny list
    pub extra_deny_phrases: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            duplicate_window: Duration::from_millis(3000),
            min_chars: 4,
            extra_deny_phrases: Vec::new(),
        }
    }
}

/// Why a transcript was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    /// Nothing left after normalization
    Empty,
    /// Matches a known hallucinated phrase
    FalsePositive,
    /// Single word below the minimum length
    TooShort,
    /// Same as the previous accepted transcript, within the window
    Duplicate,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Empty => "empty",
            Self::FalsePositive => "false_positive",
            Self::TooShort => "too_short",
            Self::Duplicate => "duplicate",
        })
    }
}

/// Stateful filter; one instance per session, fed in resolution order
#[derive(Debug)]
pub struct TranscriptFilter {
    deny: Vec<String>,
    duplicate_window: Duration,
    min_chars: usize,
    last_accepted: Option<(String, Instant)>,
}

impl TranscriptFilter {
    /// Create a filter with the built-in deny list plus configured extras
    #[must_use]
    pub fn new(config: &FilterConfig) -> Self {
        let deny = DEFAULT_DENY_PHRASES
            .iter()
            .map(|p| normalize(p))
            .chain(config.extra_deny_phrases.iter().map(|p| normalize(p)))
            .filter(|p| !p.is_empty())
            .collect();

        Self {
            deny,
            duplicate_window: config.duplicate_window,
            min_chars: config.min_chars,
            last_accepted: None,
        }
    }

    /// Decide whether `text` should become a turn
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] reason when the transcript is dropped
    pub fn evaluate(&mut self, text: &str, now: Instant) -> Result<Transcript, Rejection> {
        let normalized = normalize(text);

        if normalized.is_empty() {
            return Err(Rejection::Empty);
        }

        if self.is_false_positive(&normalized) {
            return Err(Rejection::FalsePositive);
        }

        if !normalized.contains(' ') && normalized.chars().count() < self.min_chars {
            return Err(Rejection::TooShort);
        }

        if let Some((last, at)) = &self.last_accepted
            && *last == normalized
            && now.duration_since(*at) < self.duplicate_window
        {
            return Err(Rejection::Duplicate);
        }

        self.last_accepted = Some((normalized, now));
        Ok(Transcript {
            text: text.trim().to_string(),
            timestamp: Utc::now(),
        })
    }

    fn is_false_positive(&self, normalized: &str) -> bool {
        self.deny.iter().any(|phrase| {
            phrase == normalized
                || (phrase.len() >= NEAR_MATCH_MIN_CHARS && edit_distance(phrase, normalized) <= 1)
        })
    }
}

/// Lowercase, strip punctuation, collapse whitespace
#[must_use]
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped = NON_WORD.replace_all(&lowered, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Levenshtein distance over chars
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.len().abs_diff(b.len()) > 1 {
        return a.len().abs_diff(b.len());
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
