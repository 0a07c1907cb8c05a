//! FITS-style headers: ordered keyword cards plus free-text history
//!
//! A [`Header`] keeps scalar keyword cards in insertion order and stores the
//! repeatable `HISTORY` and `COMMENT` entries separately, so that free text
//! never takes part in keyword lookups or merges.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{CubeError, Result};

/// Keywords whose assignments append free text instead of replacing a card
pub const FREE_TEXT_KEYWORDS: [&str; 2] = ["HISTORY", "COMMENT"];

/// Scalar value of a header card
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    /// Numeric view of the value; integers widen to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(v) => Some(*v as f64),
            HeaderValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view of the value; floats with no fractional part are accepted
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderValue::Bool(v) => write!(f, "{}", if *v { "T" } else { "F" }),
            HeaderValue::Int(v) => write!(f, "{v}"),
            HeaderValue::Float(v) => write!(f, "{v:e}"),
            HeaderValue::Str(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<i32> for HeaderValue {
    fn from(v: i32) -> Self {
        HeaderValue::Int(v as i64)
    }
}

impl From<u64> for HeaderValue {
    fn from(v: u64) -> Self {
        HeaderValue::Int(v as i64)
    }
}

impl From<usize> for HeaderValue {
    fn from(v: usize) -> Self {
        HeaderValue::Int(v as i64)
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Str(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Str(v)
    }
}

/// One keyword card
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub key: String,
    pub value: HeaderValue,
    pub comment: Option<String>,
}

/// Ordered keyword header with separate free-text entries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    cards: Vec<Card>,
    history: Vec<String>,
    comments: Vec<String>,
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_uppercase()
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a keyword, replacing an existing card in place or appending a new one.
    ///
    /// Assigning `HISTORY` or `COMMENT` appends a free-text entry instead.
    pub fn set(&mut self, key: &str, value: impl Into<HeaderValue>) {
        self.set_card(key, value.into(), None);
    }

    /// Like [`set`](Self::set) with a card comment
    pub fn set_with_comment(&mut self, key: &str, value: impl Into<HeaderValue>, comment: &str) {
        self.set_card(key, value.into(), Some(comment.to_string()));
    }

    fn set_card(&mut self, key: &str, value: HeaderValue, comment: Option<String>) {
        let key = normalize_key(key);
        match key.as_str() {
            "HISTORY" => self.history.push(value_text(value)),
            "COMMENT" => self.comments.push(value_text(value)),
            _ => match self.cards.iter_mut().find(|c| c.key == key) {
                Some(card) => {
                    card.value = value;
                    if comment.is_some() {
                        card.comment = comment;
                    }
                }
                None => self.cards.push(Card {
                    key,
                    value,
                    comment,
                }),
            },
        }
    }

    pub fn card(&self, key: &str) -> Option<&Card> {
        let key = normalize_key(key);
        self.cards.iter().find(|c| c.key == key)
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.card(key).map(|c| &c.value)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(HeaderValue::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(HeaderValue::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(HeaderValue::as_str)
    }

    /// Numeric keyword that must be present
    pub fn require_f64(&self, key: &str) -> Result<f64> {
        self.get_f64(key)
            .ok_or_else(|| CubeError::MissingKeyword(normalize_key(key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.card(key).is_some()
    }

    /// Remove a keyword card, returning its value
    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        let key = normalize_key(key);
        let idx = self.cards.iter().position(|c| c.key == key)?;
        Some(self.cards.remove(idx).value)
    }

    pub fn cards(&self) -> impl Iterator<Item = &Card> {
        self.cards.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.cards.iter().map(|c| c.key.as_str())
    }

    /// Number of keyword cards (free text not included)
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn add_history(&mut self, text: impl Into<String>) {
        self.history.push(text.into());
    }

    pub fn add_comment(&mut self, text: impl Into<String>) {
        self.comments.push(text.into());
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    /// Length of FITS axis `axis` (1-based) from `NAXISn`
    pub fn naxis(&self, axis: usize) -> Option<usize> {
        self.get_i64(&format!("NAXIS{axis}"))
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn set_naxis(&mut self, axis: usize, len: usize) {
        self.set(&format!("NAXIS{axis}"), len);
    }

    /// Drop every WCS keyword describing FITS axis `axis` (1-based).
    pub fn remove_axis(&mut self, axis: usize) {
        let suffix = axis.to_string();
        for base in ["NAXIS", "CTYPE", "CRVAL", "CDELT", "CRPIX", "CUNIT", "CROTA"] {
            self.remove(&format!("{base}{suffix}"));
        }
        let pc_like = |key: &str| {
            (key.starts_with("PC") || key.starts_with("CD"))
                && key[2..].split('_').any(|part| part == suffix)
        };
        self.cards.retain(|c| !pc_like(&c.key));
    }

    /// Overlay the keyword cards of `other` onto this header.
    ///
    /// Existing keys are updated in place, new keys are appended. Free-text
    /// entries are not touched. Runs in time linear in the number of cards and
    /// checks `deadline` before each card.
    pub fn merge_cards_from(
        &mut self,
        other: &Header,
        deadline: Instant,
        limit: Duration,
    ) -> Result<()> {
        let mut index: HashMap<String, usize> = self
            .cards
            .iter()
            .enumerate()
            .map(|(i, c)| (c.key.clone(), i))
            .collect();

        for card in &other.cards {
            if Instant::now() >= deadline {
                return Err(CubeError::Timeout {
                    operation: "header merge",
                    limit,
                });
            }
            match index.get(&card.key) {
                Some(&i) => self.cards[i] = card.clone(),
                None => {
                    index.insert(card.key.clone(), self.cards.len());
                    self.cards.push(card.clone());
                }
            }
        }

        Ok(())
    }

    /// Append free text from `other`, keeping at most `cap` entries of each kind.
    ///
    /// Returns the number of entries dropped by the cap.
    pub fn extend_free_text(&mut self, other: &Header, cap: usize) -> usize {
        let mut dropped = 0;
        for (mine, theirs) in [
            (&mut self.history, &other.history),
            (&mut self.comments, &other.comments),
        ] {
            let room = cap.saturating_sub(mine.len());
            let take = room.min(theirs.len());
            mine.extend(theirs.iter().take(take).cloned());
            dropped += theirs.len() - take;
        }
        dropped
    }
}

fn value_text(value: HeaderValue) -> String {
    match value {
        HeaderValue::Str(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_in_place() {
        let mut header = Header::new();
        header.set("CRPIX1", 9.0);
        header.set("crval1", 0.0);
        header.set("CRPIX1", 7.0);

        let keys: Vec<&str> = header.keys().collect();
        assert_eq!(keys, vec!["CRPIX1", "CRVAL1"]);
        assert_eq!(header.get_f64("CRPIX1"), Some(7.0));
    }

    #[test]
    fn test_free_text_is_appended() {
        let mut header = Header::new();
        header.set("HISTORY", "first");
        header.set("HISTORY", "second");
        header.set("COMMENT", "note");

        assert_eq!(header.history(), &["first".to_string(), "second".to_string()]);
        assert_eq!(header.comments(), &["note".to_string()]);
        assert!(header.get("HISTORY").is_none());
        assert!(header.is_empty());
    }

    #[test]
    fn test_numeric_views() {
        let mut header = Header::new();
        header.set("NAXIS3", 100usize);
        header.set("CDELT3", -0.1);
        header.set("CUNIT3", "km s-1");

        assert_eq!(header.naxis(3), Some(100));
        assert_eq!(header.get_f64("NAXIS3"), Some(100.0));
        assert_eq!(header.get_i64("CDELT3"), None);
        assert_eq!(header.get_str("CUNIT3"), Some("km s-1"));
        assert!(matches!(
            header.require_f64("CRVAL3"),
            Err(CubeError::MissingKeyword(k)) if k == "CRVAL3"
        ));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut original = Header::new();
        original.set("NAXIS1", 9usize);
        let mut copy = original.clone();
        copy.set("NAXIS1", 10usize);
        copy.add_history("edited");

        assert_eq!(original.naxis(1), Some(9));
        assert!(original.history().is_empty());
    }

    #[test]
    fn test_remove_axis() {
        let mut header = Header::new();
        for key in ["NAXIS3", "CTYPE3", "CRVAL3", "CDELT3", "CRPIX3", "CUNIT3"] {
            header.set(key, 1.0);
        }
        header.set("PC3_3", 1.0);
        header.set("PC1_1", 1.0);
        header.set("CRPIX1", 9.0);

        header.remove_axis(3);
        let keys: Vec<&str> = header.keys().collect();
        assert_eq!(keys, vec!["PC1_1", "CRPIX1"]);
    }

    #[test]
    fn test_merge_overlays_cards_and_skips_free_text() {
        let mut base = Header::new();
        base.set("BUNIT", "K");
        base.set("SEED", 0i64);
        base.add_history("base history");

        let mut other = Header::new();
        other.set("SEED", 1i64);
        other.set("OBJECT", "test");
        other.add_comment("should not cause any trouble");

        base.merge_cards_from(
            &other,
            Instant::now() + Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(base.get_i64("SEED"), Some(1));
        assert_eq!(base.get_str("OBJECT"), Some("test"));
        assert_eq!(base.history().len(), 1);
        assert!(base.comments().is_empty());
    }

    #[test]
    fn test_merge_past_deadline_times_out() {
        let mut base = Header::new();
        let mut other = Header::new();
        other.set("A", 1i64);

        let limit = Duration::from_millis(1);
        let result = base.merge_cards_from(&other, Instant::now() - limit, limit);
        assert!(matches!(result, Err(CubeError::Timeout { .. })));
    }

    #[test]
    fn test_free_text_cap() {
        let mut base = Header::new();
        let mut other = Header::new();
        for i in 0..10 {
            other.add_history(format!("entry {i}"));
        }
        let dropped = base.extend_free_text(&other, 4);
        assert_eq!(base.history().len(), 4);
        assert_eq!(dropped, 6);
    }
}
