use std::collections::{HashMap, HashSet};

use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Result of analyzing a raw user query. Pure function of the input and the
/// configured extra stopwords; no side effects.
#[derive(Debug, Clone, Default)]
pub struct QueryAnalysis {
    /// Lowercased, diacritic-folded, stopword-filtered tokens.
    pub tokens: Vec<String>,
    /// The whole query after normalization, stopwords retained.
    pub normalized: String,
    /// Alphanumeric runs that look like product codes.
    pub sku_candidates: Vec<String>,
    pub installation_intent: bool,
    pub catalog_intent: bool,
}

const STOPWORDS: &[&str] = &[
    // Russian
    "и", "в", "во", "не", "что", "он", "на", "я", "с", "со", "как", "а", "то", "все", "она", "так",
    "его", "но", "да", "ты", "к", "у", "же", "вы", "за", "бы", "по", "ее", "мне", "есть", "для",
    "или", "ли", "из", "о", "об", "при", "это", "этот", "эта", "мой", "какой", "какая", "можно",
    "нужно", "надо", "где", "когда", "чем", "про",
    // English
    "the", "a", "an", "of", "to", "in", "on", "for", "and", "or", "is", "are", "was", "what",
    "which", "how", "with", "that", "this", "it", "be", "do", "does", "can",
];

/// Tokens that look like SKUs but are units of measure or quantities.
const UNIT_TOKENS: &[&str] = &[
    "мм", "см", "кг", "шт", "бар", "атм", "руб", "грн", "мп", "м2", "м3", "квт", "вт", "dn", "pn",
    "mm", "cm", "kg", "pcs",
];

/// Keyword families driving intent flags. Prefix matching doubles as a light
/// stemmer for inflected forms.
const INSTALLATION_KEYWORDS: &[&str] = &[
    "монтаж", "установ", "монтир", "смонтир", "инструкц", "крепл", "крепеж", "подключ", "сборк",
    "собрат", "уклад", "install", "mount", "assembl",
];
const CATALOG_KEYWORDS: &[&str] = &[
    "характеристик", "цена", "цены", "стоимост", "артикул", "каталог", "размер", "диаметр",
    "толщин", "вариант", "модел", "ассортимент", "price", "spec", "dimension",
];

/// Suffixes stripped by the light stemmer, longest first. A stem shorter than
/// three characters is left untouched.
const STEM_SUFFIXES: &[&str] = &[
    "иями", "ями", "ами", "ого", "его", "ому", "ему", "ыми", "ими", "ешь", "ишь", "ете", "ите",
    "ует", "ют", "ят", "ах", "ях", "ов", "ев", "ей", "ий", "ый", "ой", "ая", "яя", "ое", "ее",
    "ья", "ом", "ем", "ам", "ям", "ть", "ся", "у", "ю", "а", "я", "ы", "и", "е", "о", "ь",
];

/// Lowercase, fold diacritics, and collapse `ё` into `е`.
pub fn normalize_text(raw: &str) -> String {
    raw.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .replace('ё', "е")
}

fn raw_tokens(normalized: &str) -> impl Iterator<Item = &str> {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
}

/// Trim a common inflection suffix so "трубы" and "труба" collide.
pub fn stem_lite(token: &str) -> String {
    for suffix in STEM_SUFFIXES {
        if let Some(stripped) = token.strip_suffix(suffix) {
            if stripped.chars().count() >= 3 {
                return stripped.to_owned();
            }
        }
    }
    token.to_owned()
}

/// Term-frequency multiset over normalized, stemmed tokens. Used at the
/// ingestion boundary to build `RetrieverChunk::term_counts` and by the
/// scorer for query terms.
pub fn term_counts(text: &str) -> HashMap<String, u32> {
    let normalized = normalize_text(text);
    let mut counts = HashMap::new();
    for token in raw_tokens(&normalized) {
        *counts.entry(stem_lite(token)).or_insert(0) += 1;
    }
    counts
}

fn is_sku_like(token: &str, original: &str) -> bool {
    if token.chars().count() < 3 || UNIT_TOKENS.contains(&token) {
        return false;
    }
    let has_digit = token.chars().any(|c| c.is_ascii_digit());
    let mixed_case = original.chars().any(char::is_uppercase)
        && original.chars().any(char::is_lowercase);
    (has_digit || mixed_case) && token.chars().all(char::is_alphanumeric)
}

fn matches_family(tokens: &[String], normalized: &str, family: &[&str]) -> bool {
    family.iter().any(|keyword| {
        tokens.iter().any(|token| token.starts_with(keyword)) || normalized.contains(keyword)
    })
}

/// Analyze a raw query into tokens, SKU candidates, and intent flags.
pub fn analyze_query(raw: &str, extra_stopwords: &[String]) -> QueryAnalysis {
    let normalized = normalize_text(raw);
    let extra: HashSet<&str> = extra_stopwords.iter().map(String::as_str).collect();

    let mut tokens = Vec::new();
    let mut sku_candidates = Vec::new();
    let mut seen_skus = HashSet::new();

    for original in raw
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let token = normalize_text(original);
        if is_sku_like(&token, original) && seen_skus.insert(token.clone()) {
            sku_candidates.push(token.clone());
        }
        if STOPWORDS.contains(&token.as_str()) || extra.contains(token.as_str()) {
            continue;
        }
        tokens.push(stem_lite(&token));
    }

    let installation_intent = matches_family(&tokens, &normalized, INSTALLATION_KEYWORDS);
    let catalog_intent = matches_family(&tokens, &normalized, CATALOG_KEYWORDS);

    QueryAnalysis {
        tokens,
        normalized,
        sku_candidates,
        installation_intent,
        catalog_intent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_folds_case_and_yo() {
        assert_eq!(normalize_text("Трубы Ёлочные"), "трубы елочные");
    }

    #[test]
    fn stopwords_filtered_but_kept_in_normalized() {
        let analysis = analyze_query("как установить трубу", &[]);
        assert!(analysis.tokens.iter().all(|t| t != "как"));
        assert!(analysis.normalized.contains("как"));
    }

    #[test]
    fn sku_detection_requires_digit_or_mixed_case() {
        let analysis = analyze_query("труба Стабил 16x2 PEX100 мм", &[]);
        assert!(analysis.sku_candidates.iter().any(|s| s == "16x2"));
        assert!(analysis.sku_candidates.iter().any(|s| s == "pex100"));
        // Unit token excluded even though it is short and alphanumeric.
        assert!(!analysis.sku_candidates.iter().any(|s| s == "мм"));
        // Plain lowercase word without digits is not a SKU.
        assert!(!analysis.sku_candidates.iter().any(|s| s == "труба"));
    }

    #[test]
    fn intent_flags_from_keyword_families() {
        let install = analyze_query("монтаж коллектора на стену", &[]);
        assert!(install.installation_intent);
        assert!(!install.catalog_intent);

        let catalog = analyze_query("характеристики и цена трубы", &[]);
        assert!(catalog.catalog_intent);
        assert!(!catalog.installation_intent);
    }

    #[test]
    fn extra_stopwords_respected() {
        let analysis = analyze_query("труба стабил", &["труба".to_owned()]);
        assert!(!analysis.tokens.iter().any(|t| t == "труб"));
    }

    #[test]
    fn stemming_collides_inflections() {
        let a = term_counts("труба");
        let b = term_counts("трубы");
        assert_eq!(a.keys().next(), b.keys().next());
    }
}
