//! Accept-Language primary subtag extraction

use regex::Regex;
use std::sync::LazyLock;

/// Two-letter code immediately followed by the `;` quality separator
static PRIMARY_SUBTAG: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([a-z]{2});").ok());

/// Extract the primary language codes of an `Accept-Language` header value
///
/// Only codes carrying a quality parameter are picked up (`en;q=0.9`), and each
/// code is reported once, in order of first appearance. Anything unparsable
/// yields an empty list.
pub fn primary_languages(header: &str) -> Vec<String> {
    let Some(re) = PRIMARY_SUBTAG.as_ref() else {
        return Vec::new();
    };

    let mut codes: Vec<String> = Vec::new();
    for captures in re.captures_iter(header) {
        let code = &captures[1];
        if !codes.iter().any(|c| c == code) {
            codes.push(code.to_string());
        }
    }
    codes
}
