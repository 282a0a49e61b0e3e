//! # Fuzzy Match Scorer
//!
//! Scores a remote candidate against an expected catalog track.
//!
//! ## Dimensions
//!
//! | Dimension | Weight | Score                                                   |
//! |-----------|--------|---------------------------------------------------------|
//! | title     | 0.6    | `0.6 * bigram_dice + 0.4 * normalized_levenshtein`      |
//! | artist    | 0.2    | equality, decorated-channel containment, else as title  |
//! | duration  | 0.2    | `max(0, 1 - 5 * abs(expected - actual) / expected)`     |
//!
//! A dimension only counts when both sides carry a value. Confidence is the
//! weighted sum divided by the weights actually used, so a title-only
//! comparison can still reach 1.0. Case-insensitive equality short-circuits a
//! text dimension to 1.0.
//!
//! Everything here is pure. Only tie-breaking in [`find_best_match`] depends on
//! candidate order: the first of equally scored candidates wins.

use std::cmp::Ordering;
use std::collections::HashMap;

use bridge_traits::search::MatchCandidate;
use serde::{Deserialize, Serialize};

pub const TITLE_WEIGHT: f64 = 0.6;
pub const ARTIST_WEIGHT: f64 = 0.2;
pub const DURATION_WEIGHT: f64 = 0.2;

/// Score for an uploader handle that contains the artist once channel
/// decorations are removed.
pub const DECORATED_CHANNEL_SCORE: f64 = 0.9;

const CHANNEL_DECORATIONS: &[&str] = &[" - topic", "vevo", "official"];

/// What the catalog says the track should look like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedTrack {
    pub title: String,
    pub artist: Option<String>,
    pub duration_secs: Option<f64>,
}

impl ExpectedTrack {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: None,
            duration_secs: None,
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        let artist = artist.into();
        self.artist = (!artist.trim().is_empty()).then_some(artist);
        self
    }

    pub fn with_duration_secs(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// Per-dimension scores and the weights that were applied. A weight of zero
/// means the dimension was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub title_score: f64,
    pub artist_score: f64,
    pub duration_score: f64,
    pub title_weight: f64,
    pub artist_weight: f64,
    pub duration_weight: f64,
}

impl ScoreBreakdown {
    pub fn total_weight(&self) -> f64 {
        self.title_weight + self.artist_weight + self.duration_weight
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    /// In `[0, 1]`
    pub confidence: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: MatchCandidate,
    pub score: MatchScore,
}

impl ScoredCandidate {
    pub fn confidence(&self) -> f64 {
        self.score.confidence
    }
}

// ============================================================================
// Scoring
// ============================================================================

pub fn score(expected: &ExpectedTrack, candidate: &MatchCandidate) -> MatchScore {
    let mut breakdown = ScoreBreakdown::default();

    if has_text(&expected.title) && has_text(&candidate.title) {
        breakdown.title_score = title_similarity(&expected.title, &candidate.title);
        breakdown.title_weight = TITLE_WEIGHT;
    }

    if let Some(artist) = expected.artist.as_deref().filter(|a| has_text(a)) {
        if has_text(&candidate.uploader_handle) {
            breakdown.artist_score = artist_similarity(artist, &candidate.uploader_handle);
            breakdown.artist_weight = ARTIST_WEIGHT;
        }
    }

    if let (Some(expected_secs), Some(millis)) = (expected.duration_secs, candidate.duration_millis) {
        if expected_secs > 0.0 {
            breakdown.duration_score = duration_similarity(expected_secs, millis as f64 / 1_000.0);
            breakdown.duration_weight = DURATION_WEIGHT;
        }
    }

    let total = breakdown.total_weight();
    let confidence = if total > 0.0 {
        let weighted = breakdown.title_score * breakdown.title_weight
            + breakdown.artist_score * breakdown.artist_weight
            + breakdown.duration_score * breakdown.duration_weight;
        (weighted / total).clamp(0.0, 1.0)
    } else {
        0.0
    };

    MatchScore {
        confidence,
        breakdown,
    }
}

/// Bigram Dice (repeated bigrams counted) blended with normalized edit distance.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    0.6 * bigram_dice(&a, &b) + 0.4 * strsim::normalized_levenshtein(&a, &b)
}

/// Sørensen–Dice over character bigrams, repeats counted. Whitespace is kept.
fn bigram_dice(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }

    let mut counts: HashMap<(char, char), usize> = HashMap::new();
    for pair in a.windows(2) {
        *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    let mut shared = 0usize;
    for pair in b.windows(2) {
        if let Some(count) = counts.get_mut(&(pair[0], pair[1])) {
            if *count > 0 {
                *count -= 1;
                shared += 1;
            }
        }
    }

    (2 * shared) as f64 / ((a.len() - 1) + (b.len() - 1)) as f64
}

/// Uploader handles are a weak artist proxy: "Queen - Topic" and "QueenVEVO"
/// should still score well for "Queen".
pub fn artist_similarity(artist: &str, uploader: &str) -> f64 {
    let artist = normalize(artist);
    let uploader = normalize(uploader);
    if artist.is_empty() || uploader.is_empty() {
        return 0.0;
    }
    if artist == uploader {
        return 1.0;
    }

    let stripped = CHANNEL_DECORATIONS
        .iter()
        .fold(uploader.clone(), |acc, decoration| acc.replace(decoration, ""));
    if stripped.trim().contains(&artist) {
        return DECORATED_CHANNEL_SCORE;
    }

    title_similarity(&artist, &uploader)
}

/// Full credit at an exact match, none at 20% deviation or more.
pub fn duration_similarity(expected_secs: f64, actual_secs: f64) -> f64 {
    if expected_secs <= 0.0 {
        return 0.0;
    }
    (1.0 - 5.0 * (expected_secs - actual_secs).abs() / expected_secs).max(0.0)
}

/// Parse a catalog duration: `"354"`, `"5:54"` or `"1:02:03"` into seconds.
pub fn parse_duration(raw: &str) -> Option<u64> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let mut total = 0u64;
    for (index, part) in parts.iter().enumerate() {
        let value: u64 = part.trim().parse().ok()?;
        if index > 0 && value >= 60 {
            return None;
        }
        total = total.checked_mul(60)?.checked_add(value)?;
    }
    Some(total)
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn has_text(s: &str) -> bool {
    !s.trim().is_empty()
}

// ============================================================================
// Selection
// ============================================================================

/// Highest scoring candidate at or above `threshold`. Ties go to the earlier
/// candidate.
pub fn find_best_match(
    expected: &ExpectedTrack,
    candidates: &[MatchCandidate],
    threshold: f64,
) -> Option<ScoredCandidate> {
    let mut best: Option<ScoredCandidate> = None;
    for candidate in candidates {
        let scored = score(expected, candidate);
        let better = best
            .as_ref()
            .map_or(true, |b| scored.confidence > b.score.confidence);
        if better {
            best = Some(ScoredCandidate {
                candidate: candidate.clone(),
                score: scored,
            });
        }
    }
    best.filter(|b| b.score.confidence >= threshold)
}

/// Every candidate at or above `threshold`, highest confidence first.
pub fn find_all_matches(
    expected: &ExpectedTrack,
    candidates: &[MatchCandidate],
    threshold: f64,
) -> Vec<ScoredCandidate> {
    let mut matches: Vec<ScoredCandidate> = candidates
        .iter()
        .map(|candidate| ScoredCandidate {
            candidate: candidate.clone(),
            score: score(expected, candidate),
        })
        .filter(|scored| scored.score.confidence >= threshold)
        .collect();

    matches.sort_by(|a, b| {
        b.score
            .confidence
            .partial_cmp(&a.score.confidence)
            .unwrap_or(Ordering::Equal)
    });
    matches
}
