//! Vocabulary normalization, lemmatization, and signature bucketing
//!
//! Normalization is NFKC, lowercase, trim, then diacritic folding, for every
//! language. Matching is therefore accent-insensitive everywhere; original
//! forms are preserved on the corpus and are what searches return.
//!
//! Lemmatization uses Snowball stemmers where the language has one and falls
//! back to the normalized form where it does not.

use std::collections::HashMap;

use deunicode::deunicode;
use once_cell::sync::Lazy;
use rust_stemmers::{Algorithm, Stemmer};
use unicode_normalization::UnicodeNormalization;

/// Stemmers are cheap to call but not to construct; one per algorithm is
/// shared process-wide.
static STEMMERS: Lazy<HashMap<&'static str, Stemmer>> = Lazy::new(|| {
    let mut stemmers = HashMap::new();
    for (tag, algorithm) in [
        ("en", Algorithm::English),
        ("fr", Algorithm::French),
        ("de", Algorithm::German),
        ("es", Algorithm::Spanish),
        ("it", Algorithm::Italian),
        ("pt", Algorithm::Portuguese),
        ("nl", Algorithm::Dutch),
        ("sv", Algorithm::Swedish),
        ("no", Algorithm::Norwegian),
        ("da", Algorithm::Danish),
        ("fi", Algorithm::Finnish),
        ("ru", Algorithm::Russian),
        ("ro", Algorithm::Romanian),
        ("hu", Algorithm::Hungarian),
        ("el", Algorithm::Greek),
        ("tr", Algorithm::Turkish),
        ("ar", Algorithm::Arabic),
        ("ta", Algorithm::Tamil),
    ] {
        stemmers.insert(tag, Stemmer::create(algorithm));
    }
    stemmers
});

/// Normalize a word for indexing and matching.
pub fn normalize_word(word: &str) -> String {
    let nfkc: String = word.trim().nfkc().collect();
    deunicode(&nfkc.to_lowercase())
}

/// Canonical stemmer tag for a language, if one has a Snowball stemmer.
///
/// Accepts ISO 639-1 codes and English language names, case-insensitive.
pub fn stemmer_tag(language: &str) -> Option<&'static str> {
    match language.to_ascii_lowercase().as_str() {
        "en" | "english" => Some("en"),
        "fr" | "french" => Some("fr"),
        "de" | "german" => Some("de"),
        "es" | "spanish" => Some("es"),
        "it" | "italian" => Some("it"),
        "pt" | "portuguese" => Some("pt"),
        "nl" | "dutch" => Some("nl"),
        "sv" | "swedish" => Some("sv"),
        "no" | "norwegian" => Some("no"),
        "da" | "danish" => Some("da"),
        "fi" | "finnish" => Some("fi"),
        "ru" | "russian" => Some("ru"),
        "ro" | "romanian" => Some("ro"),
        "hu" | "hungarian" => Some("hu"),
        "el" | "greek" => Some("el"),
        "tr" | "turkish" => Some("tr"),
        "ar" | "arabic" => Some("ar"),
        "ta" | "tamil" => Some("ta"),
        _ => None,
    }
}

/// Lemmatize an already-normalized word.
pub fn lemmatize(normalized: &str, language: &str) -> String {
    match stemmer_tag(language).and_then(|tag| STEMMERS.get(tag)) {
        Some(stemmer) => stemmer.stem(normalized).into_owned(),
        None => normalized.to_string(),
    }
}

/// Signature bucket key: the word's letters sorted, plus its length.
///
/// Words in the same bucket are exact anagrams of each other, and buckets
/// within a small length window make a cheap fuzzy-match prefilter.
pub fn signature_key(normalized: &str) -> String {
    let mut chars: Vec<char> = normalized.chars().collect();
    chars.sort_unstable();
    let sorted: String = chars.iter().collect();
    format!("{}:{}", sorted, normalized.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_folds_case_and_accents() {
        assert_eq!(normalize_word("  Café "), "cafe");
        assert_eq!(normalize_word("HELLO"), "hello");
        assert_eq!(normalize_word("naïve"), "naive");
    }

    #[test]
    fn test_normalize_handles_compatibility_forms() {
        // NFKC folds the ligature before the lowercase pass
        assert_eq!(normalize_word("ﬁre"), "fire");
    }

    #[test]
    fn test_lemmatize_english() {
        assert_eq!(lemmatize("running", "en"), "run");
        assert_eq!(lemmatize("cats", "english"), "cat");
    }

    #[test]
    fn test_lemmatize_unknown_language_is_identity() {
        assert_eq!(lemmatize("slovo", "xx"), "slovo");
    }

    #[test]
    fn test_signature_key_groups_anagrams() {
        assert_eq!(signature_key("listen"), signature_key("silent"));
        assert_ne!(signature_key("listen"), signature_key("listens"));
    }
}
