use once_cell::sync::Lazy;
use regex::Regex;

static HAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\p{Han}").expect("valid han regex"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
static BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n\s*(\n\s*)+").expect("valid blank line regex"));

const SENTENCE_ENDS: [char; 6] = ['。', '.', '！', '!', '？', '?'];

/// Rough token count for mixed CJK/latin text, padded so it errs high.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    let han = HAN.find_iter(text).count();
    let chars_per_token = if han * 2 > chars { 1.5 } else { 2.0 };
    let safety = if chars > 10_000 {
        1.5
    } else if chars > 5_000 {
        1.4
    } else {
        1.3
    };
    let base = (chars as f64 / chars_per_token).ceil();
    (base * safety).ceil() as usize
}

/// Cuts `text` so its estimate fits `max_tokens`, preferring a paragraph or sentence end
/// in the last 30% of the cut.
pub fn truncate_to_token_limit(text: &str, max_tokens: usize) -> String {
    let estimate = estimate_tokens(text);
    if estimate <= max_tokens {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let ratio = max_tokens as f64 / estimate as f64;
    let target = ((chars.len() as f64 * ratio * 0.85) as usize).max(1000);
    if target >= chars.len() {
        return text.to_string();
    }
    let cut = &chars[..target];
    let floor = (target as f64 * 0.7) as usize;

    let paragraph = cut
        .windows(2)
        .rposition(|pair| pair[0] == '\n' && pair[1] == '\n');
    if let Some(pos) = paragraph.filter(|pos| *pos > floor) {
        return cut[..pos].iter().collect::<String>().trim_end().to_string();
    }
    let sentence = cut.iter().rposition(|c| SENTENCE_ENDS.contains(c));
    if let Some(pos) = sentence.filter(|pos| *pos > floor) {
        return cut[..=pos].iter().collect();
    }
    let fallback = (target as f64 * 0.95) as usize;
    cut[..fallback].iter().collect()
}

/// Strips markup from stored bodies and collapses runs of blank lines.
pub fn plain_text(raw: &str) -> String {
    let stripped = TAG.replace_all(raw, " ");
    let collapsed = BLANK_LINES.replace_all(&stripped, "\n\n");
    collapsed
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
