//! Just enough HTML handling to run text filters against API fields. Comment markup is stored
//! verbatim; rewriting it is the archive frontend's job.

use log::Level;
use regex::Regex;

mod tests;

lazy_static! {
    static ref AMP_ENTITY: Regex = Regex::new(r"&amp;").unwrap();
    static ref APOS_ENTITY: Regex = Regex::new(r"&#039;").unwrap();
    static ref GT_ENTITY: Regex = Regex::new(r"&gt;").unwrap();
    static ref LT_ENTITY: Regex = Regex::new(r"&lt;").unwrap();
    static ref QUOT_ENTITY: Regex = Regex::new(r"&quot;").unwrap();
    static ref NUMERIC_CHARACTER_REFERENCE: Regex =
        Regex::new(r"&#(?:x[[:xdigit:]]+|[[:digit:]]+);").unwrap();
    static ref LINE_BREAK: Regex = Regex::new(r"(?i)<br\s*/?>").unwrap();
    static ref WORD_BREAK: Regex = Regex::new(r"(?i)<wbr\s*/?>").unwrap();
    static ref TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
}

/// Unescape the handful of HTML entities the API emits (subjects, names, comments).
pub fn unescape(input: &str) -> String {
    let input = APOS_ENTITY.replace_all(input, "'");
    let input = GT_ENTITY.replace_all(&input, ">");
    let input = LT_ENTITY.replace_all(&input, "<");
    let input = QUOT_ENTITY.replace_all(&input, "\"");

    if log_enabled!(Level::Warn) && NUMERIC_CHARACTER_REFERENCE.is_match(&input) {
        warn!("String contains unexpected entities: {}", input);
    }

    // Since each replace scans the entire string from the previous replace, it is important that we
    // replace the ampersand last. This way, we don't turn something like `&amp;gt;` into `>`
    let input = AMP_ENTITY.replace_all(&input, "&");

    input.to_string()
}

/// Reduce an HTML fragment to plain text: `<br>` becomes a newline, `<wbr>` disappears, all other
/// tags are dropped wholesale, and entities are unescaped. Filters match against this form, never
/// against raw HTML.
pub fn plain_text(input: &str) -> String {
    let input = LINE_BREAK.replace_all(input, "\n");
    let input = WORD_BREAK.replace_all(&input, "");
    let input = TAG.replace_all(&input, "");
    unescape(&input)
}
