//! Fuzzy comparison of an applicant's declared FIO against the FIO
//! extracted from the document.
//!
//! Documents arrive in Russian Cyrillic, Kazakh Cyrillic or Latin
//! transliteration, in any token order, often with initials instead of
//! full given names. Both sides are therefore normalized into three script
//! variants and compared as multisets of tokens; the comparison succeeds
//! if any cross-script combination does.

use std::sync::LazyLock;

use regex::Regex;

/// Tokens must reach this partial-ratio score (0-100) to count as a match.
const MATCH_THRESHOLD: f64 = 85.0;

/// Kazakh-specific letters and their fixed Russian counterparts.
const KAZAKH_TO_RUSSIAN: &[(char, char)] = &[
    ('ә', 'а'),
    ('ғ', 'г'),
    ('қ', 'к'),
    ('ң', 'н'),
    ('ө', 'о'),
    ('ұ', 'у'),
    ('ү', 'у'),
    ('һ', 'х'),
    ('і', 'и'),
];

/// Fixed Russian-to-Latin transliteration table.
const RUSSIAN_TO_LATIN: &[(char, &str)] = &[
    ('а', "a"),
    ('б', "b"),
    ('в', "v"),
    ('г', "g"),
    ('д', "d"),
    ('е', "e"),
    ('ё', "e"),
    ('ж', "zh"),
    ('з', "z"),
    ('и', "i"),
    ('й', "y"),
    ('к', "k"),
    ('л', "l"),
    ('м', "m"),
    ('н', "n"),
    ('о', "o"),
    ('п', "p"),
    ('р', "r"),
    ('с', "s"),
    ('т', "t"),
    ('у', "u"),
    ('ф', "f"),
    ('х', "kh"),
    ('ц', "ts"),
    ('ч', "ch"),
    ('ш', "sh"),
    ('щ', "sch"),
    ('ъ', ""),
    ('ы', "y"),
    ('ь', ""),
    ('э', "e"),
    ('ю', "yu"),
    ('я', "ya"),
];

/// Common accented Latin letters folded to their base form.
const LATIN_DIACRITICS: &[(char, char)] = &[
    ('à', 'a'),
    ('á', 'a'),
    ('â', 'a'),
    ('ã', 'a'),
    ('ä', 'a'),
    ('å', 'a'),
    ('ç', 'c'),
    ('è', 'e'),
    ('é', 'e'),
    ('ê', 'e'),
    ('ë', 'e'),
    ('ì', 'i'),
    ('í', 'i'),
    ('î', 'i'),
    ('ï', 'i'),
    ('ñ', 'n'),
    ('ò', 'o'),
    ('ó', 'o'),
    ('ô', 'o'),
    ('õ', 'o'),
    ('ö', 'o'),
    ('ù', 'u'),
    ('ú', 'u'),
    ('û', 'u'),
    ('ü', 'u'),
    ('ý', 'y'),
    ('ÿ', 'y'),
];

static NON_NAME_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\p{L}\p{N}]+").expect("static regex should be valid")
});

/// Lowercase, fold accents, strip punctuation, collapse whitespace.
fn normalize(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let folded: String = lowered
        .chars()
        .map(|ch| {
            LATIN_DIACRITICS
                .iter()
                .find(|(accented, _)| *accented == ch)
                .map(|(_, base)| *base)
                .unwrap_or(ch)
        })
        .collect();
    let spaced = NON_NAME_CHARS.replace_all(&folded, " ");
    spaced.trim().to_owned()
}

fn fold_kazakh(text: &str) -> String {
    text.chars()
        .map(|ch| {
            KAZAKH_TO_RUSSIAN
                .iter()
                .find(|(kk, _)| *kk == ch)
                .map(|(_, ru)| *ru)
                .unwrap_or(ch)
        })
        .collect()
}

fn transliterate(text: &str) -> String {
    // Kazakh letters first, so the Latin form covers both scripts.
    let russian = fold_kazakh(text);
    let mut out = String::with_capacity(russian.len());
    for ch in russian.chars() {
        match RUSSIAN_TO_LATIN.iter().find(|(ru, _)| *ru == ch) {
            Some((_, latin)) => out.push_str(latin),
            None => out.push(ch),
        }
    }
    out
}

/// The three candidate normalizations of one side.
fn variants(raw: &str) -> [String; 3] {
    let base = normalize(raw);
    let kazakh_folded = fold_kazakh(&base);
    let latin = transliterate(&base);
    [base, kazakh_folded, latin]
}

fn tokens(text: &str) -> Vec<Vec<char>> {
    text.split_whitespace()
        .map(|word| word.chars().collect())
        .collect()
}

/// Character-level partial ratio on a 0-100 scale.
///
/// The shorter string slides across equal-length windows of the longer one;
/// the best window similarity wins. This keeps initials scoring high
/// against full names and makes the measure symmetric in its arguments.
fn partial_ratio(a: &[char], b: &[char]) -> f64 {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if short.is_empty() {
        return 0.0;
    }
    if short.len() == long.len() {
        return similarity(short, long);
    }
    let mut best: f64 = 0.0;
    for window in long.windows(short.len()) {
        best = best.max(similarity(short, window));
        if best >= 100.0 {
            break;
        }
    }
    best
}

fn similarity(a: &[char], b: &[char]) -> f64 {
    let a: String = a.iter().collect();
    let b: String = b.iter().collect();
    strsim::normalized_levenshtein(&a, &b) * 100.0
}

/// Match two token multisets: every declared token must score at least the
/// threshold against a distinct extracted token. Surplus extracted tokens
/// (OCR noise, stamps, registration numbers) are tolerated.
fn multiset_matches(declared: &[Vec<char>], extracted: &[Vec<char>]) -> bool {
    if declared.is_empty() || extracted.is_empty() {
        return false;
    }
    let mut used = vec![false; extracted.len()];
    for token in declared {
        let mut best: Option<(usize, f64)> = None;
        for (idx, candidate) in extracted.iter().enumerate() {
            if used[idx] {
                continue;
            }
            let score = partial_ratio(token, candidate);
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((idx, score));
            }
        }
        match best {
            Some((idx, score)) if score >= MATCH_THRESHOLD => used[idx] = true,
            _ => return false,
        }
    }
    true
}

/// Compare a declared FIO against an extracted one.
///
/// Returns true if any of the nine cross-script variant combinations
/// passes the multiset comparison. Token order is not significant.
pub fn fio_matches(declared: &str, extracted: &str) -> bool {
    let declared_variants = variants(declared);
    let extracted_variants = variants(extracted);
    for declared_form in &declared_variants {
        let declared_tokens = tokens(declared_form);
        for extracted_form in &extracted_variants {
            if multiset_matches(&declared_tokens, &tokens(extracted_form)) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(fio_matches("Иванов Иван Иванович", "Иванов Иван Иванович"));
    }

    #[test]
    fn test_token_order_is_ignored() {
        assert!(fio_matches("Иванов Иван Иванович", "Иван Иванович Иванов"));
        assert!(fio_matches("Иванович Иванов Иван", "Иванов Иван Иванович"));
    }

    #[test]
    fn test_initials_match_full_name() {
        assert!(fio_matches("Иванов Иван Иванович", "Иванов И.И."));
        assert!(fio_matches("Иванов И.И.", "Иванов Иван Иванович"));
    }

    #[test]
    fn test_different_names_do_not_match() {
        assert!(!fio_matches("Петров Петр Петрович", "Иванов Иван"));
        assert!(!fio_matches("Иванов Иван", "Петров Петр Петрович"));
    }

    #[test]
    fn test_latin_transliteration() {
        assert!(fio_matches("Иванов Иван Иванович", "Ivanov Ivan Ivanovich"));
        assert!(fio_matches("Кузнецова Юлия", "Kuznetsova Yuliya"));
    }

    #[test]
    fn test_kazakh_cyrillic() {
        assert!(fio_matches("Әлиев Нұрлан Қайратұлы", "Алиев Нурлан Кайратулы"));
        assert!(fio_matches("Алиев Нурлан", "Әлиев Нұрлан"));
    }

    #[test]
    fn test_single_ocr_typo_in_long_token() {
        // One substitution in an eight-letter patronymic stays above the
        // threshold; the same typo in a short token would not.
        assert!(fio_matches("Иванов Иван Иванович", "Иванов Иван Лванович"));
    }

    #[test]
    fn test_extracted_noise_tokens_are_tolerated() {
        assert!(fio_matches(
            "Иванов Иван Иванович",
            "Справка Иванов Иван Иванович 12345"
        ));
    }

    #[test]
    fn test_punctuation_and_case_are_ignored() {
        assert!(fio_matches("ИВАНОВ, ИВАН", "иванов иван"));
    }

    #[test]
    fn test_symmetry_for_full_names() {
        let pairs = [
            ("Иванов Иван Иванович", "Ivanov Ivan Ivanovich"),
            ("Петров Петр Петрович", "Иванов Иван Иванович"),
            ("Әлиев Нұрлан Қайратұлы", "Алиев Нурлан Кайратулы"),
        ];
        for (a, b) in pairs {
            assert_eq!(fio_matches(a, b), fio_matches(b, a), "{a} vs {b}");
        }
    }

    #[test]
    fn test_empty_sides_never_match() {
        assert!(!fio_matches("", "Иванов Иван"));
        assert!(!fio_matches("Иванов Иван", ""));
        assert!(!fio_matches("", ""));
    }
}
