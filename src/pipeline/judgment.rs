//! Turns raw model output into a `Judgment`.
//!
//! Never fails: anything that isn't a well-formed object with the three
//! expected keys yields `ParseResult::Fallback`.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::pipeline::types::{Category, Judgment, ParseResult};

/// Parse model output into a judgment.
pub fn parse_judgment(raw: &str) -> ParseResult {
    let Some(object_text) = extract_json_object(raw) else {
        warn!(raw_len = raw.len(), "No JSON object in model output, using fallback judgment");
        return ParseResult::Fallback(Judgment::fallback());
    };

    match decode_judgment(object_text) {
        Ok(judgment) => ParseResult::Valid(judgment),
        Err(reason) => {
            warn!(reason = %reason, "Unusable model output, using fallback judgment");
            ParseResult::Fallback(Judgment::fallback())
        }
    }
}

fn decode_judgment(text: &str) -> Result<Judgment, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| format!("JSON parse error: {e}"))?;
    let Value::Object(map) = value else {
        return Err("top-level value is not an object".into());
    };

    let label = required(&map, "category")?
        .as_str()
        .ok_or("category is not a string")?;
    let category = Category::from_label(label);
    if category == Category::Other && !label.trim().eq_ignore_ascii_case("other") {
        debug!(label = %label, "Unrecognized category, treating as Other");
    }

    let confidence = coerce_confidence(required(&map, "confidence")?)?;

    let reply = required(&map, "reply")?
        .as_str()
        .ok_or("reply is not a string")?
        .trim()
        .to_string();

    Ok(Judgment::new(category, confidence, reply))
}

fn required<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Value, String> {
    map.get(key).ok_or_else(|| format!("missing key '{key}'"))
}

/// Accepts a JSON number or a numeric string.
fn coerce_confidence(value: &Value) -> Result<f32, String> {
    let number = match value {
        Value::Number(n) => n.as_f64().ok_or("confidence is not representable")?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("confidence '{s}' is not numeric"))?,
        other => return Err(format!("confidence has wrong type: {other}")),
    };
    if !number.is_finite() {
        return Err("confidence is not finite".into());
    }
    Ok(number.clamp(0.0, 1.0) as f32)
}

/// Locate the first balanced `{ ... }` in `text`.
///
/// Braces inside JSON string literals are ignored so a reply containing `}`
/// does not end the object early.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}
