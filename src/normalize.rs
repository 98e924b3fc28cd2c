//! Text normalization shared by cache keying, fingerprinting and prompt building.
//! Canonical forms are lossy on purpose: trivially different inputs must collide.

use std::sync::OnceLock;

use regex::Regex;

/// Canonical form used for cache keys: lower-cased, trimmed, only `[a-z0-9 ]`,
/// whitespace runs collapsed to a single space.
pub fn canonicalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else if c.is_whitespace() {
            pending_space = true;
        }
        // Everything else (punctuation, symbols, non-ASCII) is dropped.
    }
    out
}

/// Normalized form used for similarity fingerprints. Keeps word boundaries at
/// punctuation (unlike `canonicalize`) so "salt,pepper" yields two tokens.
pub fn normalize_content(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            out.push(c);
        } else if !out.ends_with(' ') && !out.is_empty() {
            out.push(' ');
        }
    }
    out.trim_end().to_string()
}

/// Detects the dominant language of `text` using whatlang.
/// Returns an ISO 639-1 code or None if detection is unreliable.
pub fn detect_language(text: &str) -> Option<String> {
    let info = whatlang::detect(text)?;
    if !info.is_reliable() {
        return None;
    }
    Some(lang_to_code(info.lang()))
}

fn lang_to_code(lang: whatlang::Lang) -> String {
    use whatlang::Lang::*;
    match lang {
        Eng => "en",
        Cmn => "zh",
        Jpn => "ja",
        Kor => "ko",
        Fra => "fr",
        Deu => "de",
        Spa => "es",
        Rus => "ru",
        Por => "pt",
        Ita => "it",
        Tur => "tr",
        Vie => "vi",
        Tha => "th",
        Nld => "nl",
        Pol => "pl",
        _ => "other",
    }
    .to_string()
}

/// A portion parsed from the front of a free-text food description.
#[derive(Debug, Clone, PartialEq)]
pub struct Portion {
    pub quantity: f64,
    pub unit: String,
    /// The description with the quantity removed.
    pub query: String,
}

pub const DEFAULT_PORTION_GRAMS: f64 = 100.0;

fn quantity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^\s*(\d+(?:[.,]\d+)?)\s*",
            r"(g|grams?|ml|millilit(?:er|re)s?)\b\s*(?:of\s+)?(.*)$",
        ))
        .expect("quantity pattern is valid")
    })
}

/// Parses a leading gram/ml quantity ("150g rice", "250 ml of milk").
/// Without one the portion defaults to 100 g, the unit structured providers report in.
pub fn parse_portion(text: &str) -> Portion {
    if let Some(caps) = quantity_pattern().captures(text) {
        let qty = caps[1].replace(',', ".").parse::<f64>().ok();
        let rest = caps[3].trim();
        if let (Some(quantity), false) = (qty, rest.is_empty()) {
            let unit = if caps[2].to_lowercase().starts_with('m') {
                "ml"
            } else {
                "g"
            };
            return Portion {
                quantity,
                unit: unit.to_string(),
                query: rest.to_string(),
            };
        }
    }
    Portion {
        quantity: DEFAULT_PORTION_GRAMS,
        unit: "g".to_string(),
        query: text.trim().to_string(),
    }
}

fn separator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\s*(?:[;+&]|\band\b)\s*").expect("separator pattern is valid")
    })
}

/// Splits a description listing several foods ("150g chicken, 200g rice",
/// "toast and jam") into its parts. A comma between digits is a decimal
/// separator and does not split.
pub fn split_foods(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b',' {
            continue;
        }
        let decimal = i > 0
            && bytes[i - 1].is_ascii_digit()
            && bytes.get(i + 1).is_some_and(u8::is_ascii_digit);
        if !decimal {
            chunks.push(&text[start..i]);
            start = i + 1;
        }
    }
    chunks.push(&text[start..]);

    chunks
        .into_iter()
        .flat_map(|chunk| separator_pattern().split(chunk))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pulls the outermost JSON object out of model output that may be wrapped in
/// code fences or surrounded by prose.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_foods_on_lists() {
        assert_eq!(
            split_foods("150g grilled chicken breast, 200g white rice"),
            vec!["150g grilled chicken breast", "200g white rice"]
        );
        assert_eq!(
            split_foods("toast AND jam; coffee + milk & sugar"),
            vec!["toast", "jam", "coffee", "milk", "sugar"]
        );
        assert_eq!(split_foods("1,5 g salt, pepper"), vec!["1,5 g salt", "pepper"]);
        assert_eq!(split_foods("banana"), vec!["banana"]);
        assert_eq!(split_foods("sandwich"), vec!["sandwich"]);
        assert!(split_foods(" , and ").is_empty());
    }

    #[test]
    fn canonicalize_collapses_trivial_differences() {
        assert_eq!(canonicalize("Banana!"), "banana");
        assert_eq!(canonicalize("  banana  "), "banana");
        assert_eq!(canonicalize("Peanut   Butter, crunchy"), "peanut butter crunchy");
        assert_eq!(canonicalize(""), "");
        assert_eq!(canonicalize("!!!"), "");
    }

    #[test]
    fn canonicalize_drops_non_ascii() {
        assert_eq!(canonicalize("Crème brûlée"), "crme brle");
    }

    #[test]
    fn normalize_content_splits_on_punctuation() {
        assert_eq!(normalize_content("Salt,Pepper;  OIL."), "salt pepper oil");
        assert_eq!(normalize_content(""), "");
    }

    #[test]
    fn portion_with_grams() {
        let p = parse_portion("150g cooked rice");
        assert_eq!(p.quantity, 150.0);
        assert_eq!(p.unit, "g");
        assert_eq!(p.query, "cooked rice");
    }

    #[test]
    fn portion_with_ml_and_of() {
        let p = parse_portion("250 ml of whole milk");
        assert_eq!(p.quantity, 250.0);
        assert_eq!(p.unit, "ml");
        assert_eq!(p.query, "whole milk");
    }

    #[test]
    fn portion_defaults_to_100g() {
        let p = parse_portion(" banana ");
        assert_eq!(p.quantity, DEFAULT_PORTION_GRAMS);
        assert_eq!(p.query, "banana");
    }

    #[test]
    fn bare_number_is_not_a_portion() {
        let p = parse_portion("7 up");
        assert_eq!(p.query, "7 up");
        assert_eq!(p.quantity, DEFAULT_PORTION_GRAMS);
    }

    #[test]
    fn json_extraction_handles_fences() {
        let raw = "Sure!\n```json\n{\"a\": {\"b\": 1}}\n```";
        assert_eq!(extract_json_object(raw), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn detects_english() {
        let lang =
            detect_language("two scrambled eggs with buttered toast and a glass of orange juice");
        assert_eq!(lang.as_deref(), Some("en"));
    }
}
