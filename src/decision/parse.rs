// =============================================================================
// LLM Output Repair & Parsing — free text in, decision DTOs out
// =============================================================================
//
// The raw response is expected to contain, somewhere, a JSON array of
// decision objects. Before parsing we apply a set of idempotent repairs for
// the damage LLMs routinely inflict: zero-width runes, full-width CJK
// punctuation, empty strings where numbers belong, and thousand-separator
// commas inside numeric literals. When no array can be found at all, a
// single `wait` decision quoting the head of the raw text is synthesised —
// a safe fallback is preferred over crashing the cycle.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Numeric wire fields whose empty-string values are repaired to `null`.
const NUMERIC_FIELDS: &[&str] = &[
    "leverage",
    "position_size_usd",
    "stop_loss",
    "take_profit",
    "confidence",
    "risk_usd",
    "new_stop_loss",
    "new_take_profit",
    "close_percentage",
];

/// How much of the raw text the fallback `wait` decision quotes.
const FALLBACK_QUOTE_CHARS: usize = 240;

/// Wire-shape decision as received, after JSON repair. This is the DTO the
/// journal records verbatim; the validator reifies it into a typed
/// [`crate::decision::Decision`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDecision {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub position_size_usd: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub new_stop_loss: Option<f64>,
    #[serde(default)]
    pub new_take_profit: Option<f64>,
    #[serde(default)]
    pub close_percentage: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub risk_usd: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
}

impl RawDecision {
    /// The fallback decision synthesised when no JSON array is found.
    pub fn fallback_wait(raw_text: &str) -> Self {
        let quoted: String = raw_text.chars().take(FALLBACK_QUOTE_CHARS).collect();
        Self {
            action: "wait".to_string(),
            reasoning: format!("no decision array found in response: {quoted}"),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Repair
// ---------------------------------------------------------------------------

/// Apply all repairs. Idempotent: `repair(repair(t)) == repair(t)`.
pub fn repair_json(raw: &str) -> String {
    let stripped = strip_invisible(raw);
    let ascii = asciify_punctuation(&stripped);
    let bracketed = normalize_bracket_runs(&ascii);
    let nulled = null_empty_numeric_fields(&bracketed);
    collapse_thousand_separators(&nulled)
}

/// Remove zero-width and BOM runes.
fn strip_invisible(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}'))
        .collect()
}

/// Translate full-width brackets/braces/colons/commas/quotes and CJK
/// punctuation to their ASCII equivalents.
fn asciify_punctuation(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '［' => '[',
            '］' => ']',
            '｛' => '{',
            '｝' => '}',
            '：' => ':',
            '，' | '、' => ',',
            '＂' | '“' | '”' => '"',
            '‘' | '’' => '\'',
            '（' => '(',
            '）' => ')',
            '。' => '.',
            _ => c,
        })
        .collect()
}

/// Normalise `[ {` to `[{` (any run of spaces between).
fn normalize_bracket_runs(s: &str) -> String {
    let mut out = s.to_string();
    while out.contains("[ {") {
        out = out.replace("[ {", "[{");
    }
    out
}

/// Replace empty strings for known numeric fields with `null`.
fn null_empty_numeric_fields(s: &str) -> String {
    let mut out = s.to_string();
    for field in NUMERIC_FIELDS {
        for spacing in [
            format!("\"{field}\": \"\""),
            format!("\"{field}\":\"\""),
            format!("\"{field}\" : \"\""),
        ] {
            out = out.replace(&spacing, &format!("\"{field}\": null"));
        }
    }
    out
}

/// Collapse thousand-separator commas between digit groups:
/// `100,500` → `100500`. A comma qualifies when a digit precedes it and
/// exactly three digits follow before the next non-digit.
fn collapse_thousand_separators(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(chars.len());

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == ','
            && i > 0
            && chars[i - 1].is_ascii_digit()
            && i + 3 < chars.len()
            && chars[i + 1].is_ascii_digit()
            && chars[i + 2].is_ascii_digit()
            && chars[i + 3].is_ascii_digit()
            && chars.get(i + 4).map_or(true, |n| !n.is_ascii_digit())
        {
            // Thousand separator — drop it.
            i += 1;
            continue;
        }
        out.push(c);
        i += 1;
    }

    out
}

// ---------------------------------------------------------------------------
// Extraction & parsing
// ---------------------------------------------------------------------------

/// Find the first balanced JSON array in `text`, respecting string literals
/// and escapes. Returns the array substring.
pub fn extract_json_array(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('[')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Repair `raw_text` and parse the decision array out of it.
///
/// Never fails: a missing or unparsable array yields exactly one fallback
/// `wait` decision.
pub fn parse_decisions(raw_text: &str) -> Vec<RawDecision> {
    let repaired = repair_json(raw_text);

    let parsed = extract_json_array(&repaired)
        .and_then(|slice| serde_json::from_str::<Vec<serde_json::Value>>(slice).ok());

    let Some(values) = parsed else {
        warn!(
            chars = raw_text.len(),
            "llm response carries no parsable decision array — synthesising wait"
        );
        return vec![RawDecision::fallback_wait(raw_text)];
    };

    let decisions: Vec<RawDecision> = values
        .iter()
        .filter(|v| v.is_object())
        .map(decision_from_value)
        .collect();

    if decisions.is_empty() {
        return vec![RawDecision::fallback_wait(raw_text)];
    }

    decisions
}

/// Build one DTO from a decision object, tolerating numbers-as-strings.
fn decision_from_value(value: &serde_json::Value) -> RawDecision {
    RawDecision {
        action: get_str(value, "action"),
        symbol: get_str(value, "symbol"),
        leverage: get_f64(value, "leverage"),
        position_size_usd: get_f64(value, "position_size_usd"),
        stop_loss: get_f64(value, "stop_loss"),
        take_profit: get_f64(value, "take_profit"),
        new_stop_loss: get_f64(value, "new_stop_loss"),
        new_take_profit: get_f64(value, "new_take_profit"),
        close_percentage: get_f64(value, "close_percentage"),
        confidence: get_f64(value, "confidence"),
        risk_usd: get_f64(value, "risk_usd"),
        reasoning: get_str(value, "reasoning"),
    }
}

fn get_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Accept a number, or a numeric string. Null/omitted/unparsable is `None` —
/// an omitted numeric field is *unset*, never zero.
fn get_f64(value: &serde_json::Value, key: &str) -> Option<f64> {
    match value.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}
