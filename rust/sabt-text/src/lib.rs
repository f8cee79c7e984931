// sabt-text: Text normalization for Persian data hygiene
//
// Every cell headed for the Sabt spreadsheet and every auth-related header
// passes through here. The pipeline, in order: NFKC, digit folding,
// Arabic letter unification, zero-width stripping, whitespace handling,
// control stripping, trim.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Result type for text operations
pub type TextResult<T> = Result<T, TextError>;

/// Text validation errors
#[derive(Debug, Error)]
pub enum TextError {
    /// Header contained a raw control character
    #[error("control characters not permitted in headers")]
    ControlCharacter,
}

/// Leading characters Excel would interpret as a formula
pub const FORMULA_PREFIXES: [char; 4] = ['=', '+', '-', '@'];

const PERSIAN_DIGITS: [char; 10] = ['۰', '۱', '۲', '۳', '۴', '۵', '۶', '۷', '۸', '۹'];
const ARABIC_DIGITS: [char; 10] = ['٠', '١', '٢', '٣', '٤', '٥', '٦', '٧', '٨', '٩'];

fn fold_digit(ch: char) -> char {
    if let Some(idx) = PERSIAN_DIGITS.iter().position(|d| *d == ch) {
        return (b'0' + idx as u8) as char;
    }
    if let Some(idx) = ARABIC_DIGITS.iter().position(|d| *d == ch) {
        return (b'0' + idx as u8) as char;
    }
    ch
}

/// Fold Persian and Arabic-Indic digits to ASCII
pub fn fold_digits(text: &str) -> String {
    text.chars().map(fold_digit).collect()
}

fn is_zero_width(ch: char) -> bool {
    matches!(
        ch,
        '\u{200B}'..='\u{200D}' | '\u{FEFF}' | '\u{202A}'..='\u{202C}' | '\u{2060}'
    )
}

fn unify_letters(ch: char) -> char {
    match ch {
        'ك' => 'ک',
        'ي' => 'ی',
        other => other,
    }
}

/// Normalize one spreadsheet cell.
///
/// `None` becomes the empty string. CR/LF/TAB collapse to a single space;
/// remaining C0 controls are dropped entirely.
pub fn normalize_cell(value: Option<&str>) -> String {
    let text = value.unwrap_or_default();
    let folded: String = text
        .nfkc()
        .map(fold_digit)
        .map(unify_letters)
        .filter(|ch| !is_zero_width(*ch))
        .map(|ch| match ch {
            '\r' | '\n' | '\t' => ' ',
            other => other,
        })
        .filter(|ch| *ch >= ' ')
        .collect();
    folded.trim().to_string()
}

/// Normalize an auth token or header value: zero-width strip, NFKC, digit
/// fold, trim. Interior whitespace is preserved.
pub fn normalize_token(value: Option<&str>) -> String {
    let text = value.unwrap_or_default();
    let cleaned: String = text
        .chars()
        .filter(|ch| !is_zero_width(*ch))
        .collect::<String>()
        .nfkc()
        .map(fold_digit)
        .collect();
    cleaned.trim().to_string()
}

/// Digits-only phone normalization, applied after folding
pub fn sanitize_phone(value: Option<&str>) -> String {
    fold_digits(value.unwrap_or_default())
        .chars()
        .filter(|ch| ch.is_ascii_digit())
        .collect()
}

/// Reject header values that carry raw control characters
pub fn ensure_no_control_chars<'a, I>(values: I) -> TextResult<()>
where
    I: IntoIterator<Item = &'a str>,
{
    for value in values {
        if value.chars().any(|ch| ch.is_control()) {
            return Err(TextError::ControlCharacter);
        }
    }
    Ok(())
}

/// Prefix `text` with an apostrophe when the raw value would be read as a
/// spreadsheet formula.
///
/// The decision is made on the raw value (NFKC + zero-width stripped), not
/// on the normalized text, so a guard cannot be dodged with zero-width
/// padding in front of the `=`.
pub fn guard_formula(text: String, raw: Option<&str>) -> String {
    if text.is_empty() {
        return text;
    }
    let candidate: String = raw
        .unwrap_or_default()
        .nfkc()
        .filter(|ch| !is_zero_width(*ch))
        .collect();
    let stripped = candidate.trim_start_matches(|ch: char| ch.is_whitespace() && ch != '\t');
    match stripped.chars().next() {
        Some(first) if FORMULA_PREFIXES.contains(&first) || first == '\t' => {
            format!("'{text}")
        }
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn persian_and_arabic_digits_fold_to_ascii() {
        assert_eq!(fold_digits("۰۹۱۲۳۴۵۶۷۸۹"), "09123456789");
        assert_eq!(fold_digits("٠١٢٣٤٥٦٧٨٩"), "0123456789");
    }

    #[test]
    fn normalize_cell_unifies_arabic_letters() {
        assert_eq!(normalize_cell(Some("علي كريم")), "علی کریم");
    }

    #[test]
    fn normalize_cell_strips_zero_width_and_controls() {
        assert_eq!(normalize_cell(Some("ab\u{200B}cd\u{FEFF}")), "abcd");
        assert_eq!(normalize_cell(Some("a\u{0007}b")), "ab");
    }

    #[test]
    fn normalize_cell_replaces_line_breaks_with_spaces() {
        assert_eq!(normalize_cell(Some("a\r\nb\tc")), "a  b c");
    }

    #[test]
    fn normalize_cell_of_none_is_empty() {
        assert_eq!(normalize_cell(None), "");
    }

    #[test]
    fn sanitize_phone_folds_then_keeps_digits() {
        assert_eq!(sanitize_phone(Some("۰۹۱۲-۳۴۵ ۶۷۸۹")), "09123456789");
        assert_eq!(sanitize_phone(Some("+98 912 345 6789")), "989123456789");
    }

    #[test]
    fn guard_formula_prefixes_risky_cells() {
        for raw in ["=SUM(A1:A2)", "+98", "-1", "@cmd", "\tcmd"] {
            let guarded = guard_formula(normalize_cell(Some(raw)), Some(raw));
            assert!(guarded.starts_with('\''), "{raw} not guarded: {guarded}");
        }
    }

    #[test]
    fn guard_formula_sees_through_zero_width_padding() {
        let raw = "\u{200B}=1+1";
        let guarded = guard_formula(normalize_cell(Some(raw)), Some(raw));
        assert!(guarded.starts_with('\''));
    }

    #[test]
    fn guard_formula_leaves_plain_text_alone() {
        let guarded = guard_formula("Ali".to_string(), Some("Ali"));
        assert_eq!(guarded, "Ali");
    }

    #[test]
    fn normalize_token_strips_zero_width_but_keeps_interior_spaces() {
        assert_eq!(
            normalize_token(Some("  Bearer\u{200C} tok-۱ ")),
            "Bearer tok-1"
        );
    }

    #[test]
    fn control_chars_in_headers_are_rejected() {
        assert!(ensure_no_control_chars(["ok-value"]).is_ok());
        assert!(ensure_no_control_chars(["bad\u{0000}value"]).is_err());
    }

    proptest! {
        #[test]
        fn normalized_cells_never_contain_controls(input in ".*") {
            let out = normalize_cell(Some(&input));
            prop_assert!(!out.chars().any(|ch| ch.is_control()));
        }

        #[test]
        fn normalized_cells_never_contain_source_digits(input in ".*") {
            let out = normalize_cell(Some(&input));
            prop_assert!(!out.chars().any(|ch| PERSIAN_DIGITS.contains(&ch)));
            prop_assert!(!out.chars().any(|ch| ARABIC_DIGITS.contains(&ch)));
        }

        #[test]
        fn guarded_output_never_starts_with_formula_char(input in ".*") {
            let out = guard_formula(normalize_cell(Some(&input)), Some(&input));
            if let Some(first) = out.chars().next() {
                prop_assert!(first != '=' || !input.trim_start().starts_with('='));
            }
        }
    }
}
