//! Value normalization shared by every stage of the pipeline.
//!
//! Government extracts spell "no value" in several ways (empty cells, the
//! literal `None`/`nan`/`null` left behind by earlier exports, `S/N` for
//! addresses without a number, `0` for coordinates). All of them collapse
//! into `None` here so the rest of the crate only deals with `Option`.

use encoding_rs::WINDOWS_1252;

const BLANK_TOKENS: &[&str] = &["none", "nan", "null"];
const PLACEHOLDER_TOKENS: &[&str] = &["s/n", "s-n", "sn"];

/// Municipality code of Brasília. Every code under the federal-district
/// prefix is folded into it.
pub const FEDERAL_DISTRICT_SEAT: &str = "530010";
const FEDERAL_DISTRICT_PREFIX: &str = "53";

/// Canonical blank check: empty, whitespace, or a null-like token in any case.
pub fn is_blank(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || BLANK_TOKENS
            .iter()
            .any(|token| trimmed.eq_ignore_ascii_case(token))
}

pub fn is_blank_opt(value: Option<&str>) -> bool {
    value.map(is_blank).unwrap_or(true)
}

/// Trimmed value, or `None` when blank.
pub fn clean(value: &str) -> Option<String> {
    if is_blank(value) {
        None
    } else {
        Some(value.trim().to_string())
    }
}

/// Like [`clean`], but also drops address placeholders such as `S/N`.
pub fn clean_address_part(value: &str) -> Option<String> {
    clean(value).filter(|v| {
        !PLACEHOLDER_TOKENS
            .iter()
            .any(|token| v.eq_ignore_ascii_case(token))
    })
}

/// A coordinate cell counts as missing when blank or numerically zero.
pub fn is_missing_coordinate(value: &str) -> bool {
    parse_coordinate(value).is_none()
}

/// Parses a coordinate written with either a decimal point or a decimal comma.
pub fn parse_coordinate(value: &str) -> Option<f64> {
    if is_blank(value) {
        return None;
    }
    let parsed = value.trim().replace(',', ".").parse::<f64>().ok()?;
    if !parsed.is_finite() || parsed == 0.0 {
        return None;
    }
    Some(parsed)
}

pub fn format_coordinate(value: f64) -> String {
    value.to_string()
}

/// Normalizes an IBGE municipality code to six digits.
///
/// A seventh (check) digit is cut, shorter codes are left-padded with zeros,
/// and anything under the federal-district prefix becomes [`FEDERAL_DISTRICT_SEAT`].
pub fn normalize_municipality_code(value: &str) -> Option<String> {
    if is_blank(value) {
        return None;
    }
    let parsed = value.trim().parse::<f64>().ok()?;
    if !parsed.is_finite() || parsed < 0.0 {
        return None;
    }
    let mut code = format!("{}", parsed.trunc() as u64);
    if code.len() == 7 {
        code.truncate(6);
    }
    let code = format!("{code:0>6}");
    if code.starts_with(FEDERAL_DISTRICT_PREFIX) {
        return Some(FEDERAL_DISTRICT_SEAT.to_string());
    }
    Some(code)
}

/// Decodes the windows-1252 bytes of the DataSUS extracts (a superset of
/// Latin-1 for everything outside 0x80..=0x9F).
pub fn decode_latin1(bytes: &[u8]) -> String {
    WINDOWS_1252
        .decode_without_bom_handling(bytes)
        .0
        .into_owned()
}

/// UTF-8 when the bytes are valid UTF-8, windows-1252 otherwise. Extracts
/// that were already re-saved as UTF-8 pass through untouched.
pub fn decode_field(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => decode_latin1(bytes),
    }
}
