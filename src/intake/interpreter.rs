//! Decoding of raw model output into a [`TurnResult`].
//!
//! The model is asked for a bare JSON object but often wraps it in a code
//! fence or prefixes a `json` label. Those wrappers are stripped, then the
//! payload is decoded strictly. Anything that is not an object with a string
//! `respuesta` is a [`TurnError::MalformedTurn`]; no field is guessed.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::TurnError;
use crate::intake::model::ProfileUpdate;

/// Payload keys.
pub mod keys {
    pub const REPLY: &str = "respuesta";
    pub const STEP: &str = "step";
    pub const INTERVAL: &str = "intervalo";
    pub const PET_NAME: &str = "Nombre_mascota";
    pub const PREFERENCE: &str = "preferencia";
    pub const BREED: &str = "raza_mascota";
}

/// Weeks in a month, as used when the model reports an interval in months.
pub const WEEKS_PER_MONTH: f64 = 4.34524;

static INTERVAL_WITH_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d+(?:[.,]\d+)?)\s*(d[ií]as?|semanas?|mes(?:es)?)$").unwrap()
});

/// The `intervalo` field, after coercion to whole weeks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IntervalField {
    /// Not present (or null) this turn.
    #[default]
    Absent,
    Weeks(u32),
    /// Present but not a non-negative number of weeks. Carries the raw value.
    Invalid(String),
}

impl IntervalField {
    /// `Ok(None)` when absent, `Err` when present but unusable.
    pub fn weeks(&self) -> Result<Option<u32>, TurnError> {
        match self {
            Self::Absent => Ok(None),
            Self::Weeks(w) => Ok(Some(*w)),
            Self::Invalid(value) => Err(TurnError::IntervalCoercion {
                value: value.clone(),
            }),
        }
    }
}

/// Structured result of one model turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    /// Text to send back to the user.
    pub reply: String,
    /// `None` when the model omitted the step.
    pub step: Option<u32>,
    pub interval: IntervalField,
    pub pet_name: Option<String>,
    pub preference: Option<String>,
    pub breed: Option<String>,
}

impl TurnResult {
    /// A bare reply with nothing extracted.
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: text.into(),
            step: None,
            interval: IntervalField::Absent,
            pet_name: None,
            preference: None,
            breed: None,
        }
    }

    /// Extracted pet facts as an additive profile update. Never carries the
    /// display name or the step.
    pub fn profile_update(&self) -> ProfileUpdate {
        ProfileUpdate {
            pet_name: self.pet_name.clone(),
            preferences: self.preference.clone(),
            pet_type: self.breed.clone(),
            ..Default::default()
        }
    }
}

/// Decode raw model text.
pub fn interpret(raw: &str) -> Result<TurnResult, TurnError> {
    let payload = strip_wrappers(raw);
    let malformed = |reason: String| TurnError::MalformedTurn {
        raw: raw.to_string(),
        reason,
    };

    let value: Value = serde_json::from_str(payload).map_err(|e| malformed(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(malformed("payload is not an object".to_string()));
    };

    let reply = match obj.get(keys::REPLY) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::String(_)) => return Err(malformed(format!("`{}` is empty", keys::REPLY))),
        Some(other) => {
            return Err(malformed(format!(
                "`{}` is not a string: {other}",
                keys::REPLY
            )));
        }
        None => return Err(malformed(format!("missing `{}`", keys::REPLY))),
    };

    let step = decode_step(obj.get(keys::STEP)).map_err(malformed)?;
    let interval = decode_interval(obj.get(keys::INTERVAL));

    Ok(TurnResult {
        reply,
        step,
        interval,
        pet_name: text_field(&obj, keys::PET_NAME).map_err(malformed)?,
        preference: text_field(&obj, keys::PREFERENCE).map_err(malformed)?,
        breed: text_field(&obj, keys::BREED).map_err(malformed)?,
    })
}

/// Remove code fences and a leading `json`/`python` label.
fn strip_wrappers(raw: &str) -> &str {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix("```") {
        text = rest;
        if let Some(rest) = text.strip_suffix("```") {
            text = rest;
        }
    }
    text = text.trim();

    for label in ["json", "python", "JSON"] {
        if let Some(rest) = text.strip_prefix(label) {
            let rest = rest.trim_start();
            if rest.starts_with('{') {
                text = rest;
                break;
            }
        }
    }
    text.trim()
}

fn decode_step(value: Option<&Value>) -> Result<Option<u32>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => number_to_u32(n)
            .map(Some)
            .ok_or_else(|| format!("`{}` is not a non-negative integer: {n}", keys::STEP)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| format!("`{}` is not a non-negative integer: {s:?}", keys::STEP)),
        Some(other) => Err(format!("`{}` has the wrong type: {other}", keys::STEP)),
    }
}

fn decode_interval(value: Option<&Value>) -> IntervalField {
    match value {
        None | Some(Value::Null) => IntervalField::Absent,
        Some(Value::Number(n)) => match number_to_u32(n) {
            Some(weeks) => IntervalField::Weeks(weeks),
            None => IntervalField::Invalid(n.to_string()),
        },
        Some(Value::String(s)) if s.trim().is_empty() => IntervalField::Absent,
        Some(Value::String(s)) => match weeks_from_text(s) {
            Some(weeks) => IntervalField::Weeks(weeks),
            None => IntervalField::Invalid(s.clone()),
        },
        Some(other) => IntervalField::Invalid(other.to_string()),
    }
}

/// Whole non-negative numbers only; `8.0` is accepted, `8.5` is not.
fn number_to_u32(n: &serde_json::Number) -> Option<u32> {
    if let Some(u) = n.as_u64() {
        return u32::try_from(u).ok();
    }
    let f = n.as_f64()?;
    if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= f64::from(u32::MAX) {
        Some(f as u32)
    } else {
        None
    }
}

/// `"9"` is nine weeks. `"10 dias"`, `"8 semanas"` and `"2 meses"` are
/// converted and rounded to the nearest week.
pub fn weeks_from_text(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Ok(weeks) = text.parse::<u32>() {
        return Some(weeks);
    }

    let caps = INTERVAL_WITH_UNIT.captures(text)?;
    let amount: f64 = caps[1].replace(',', ".").parse().ok()?;
    let unit = caps[2].to_lowercase();
    let weeks = if unit.starts_with('d') {
        amount / 7.0
    } else if unit.starts_with('s') {
        amount
    } else {
        amount * WEEKS_PER_MONTH
    };

    let rounded = weeks.round();
    if rounded.is_finite() && rounded >= 0.0 && rounded <= f64::from(u32::MAX) {
        Some(rounded as u32)
    } else {
        None
    }
}

/// Optional free-text field. Null or blank means absent; any other
/// non-string type is rejected.
fn text_field(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(format!("`{key}` is not a string: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_object() {
        let result = interpret(r#"{"respuesta": "¡Hola! ...", "step": 1}"#).unwrap();
        assert_eq!(result.reply, "¡Hola! ...");
        assert_eq!(result.step, Some(1));
        assert_eq!(result.interval, IntervalField::Absent);
        assert!(result.pet_name.is_none());
    }

    #[test]
    fn fenced_and_labelled_payloads() {
        let inputs = [
            "```json\n{\"respuesta\": \"ok\", \"step\": 2}\n```",
            "```python\n{\"respuesta\": \"ok\", \"step\": 2}\n```",
            "```\n{\"respuesta\": \"ok\", \"step\": 2}\n```",
            "json {\"respuesta\": \"ok\", \"step\": 2}",
            "  \n{\"respuesta\": \"ok\", \"step\": 2}\n  ",
        ];
        for input in inputs {
            let result = interpret(input).unwrap_or_else(|e| panic!("{input:?}: {e}"));
            assert_eq!(result.step, Some(2));
        }
    }

    #[test]
    fn full_payload() {
        let raw = r#"{"respuesta": "¡Gracias!", "Nombre_mascota": "Firulais",
            "preferencia": "Royal Canin", "raza_mascota": "Golden Retriever", "step": 6}"#;
        let result = interpret(raw).unwrap();
        assert_eq!(result.pet_name.as_deref(), Some("Firulais"));
        assert_eq!(result.preference.as_deref(), Some("Royal Canin"));
        assert_eq!(result.breed.as_deref(), Some("Golden Retriever"));

        let update = result.profile_update();
        assert_eq!(update.pet_type.as_deref(), Some("Golden Retriever"));
        assert!(update.name.is_none());
        assert!(update.step.is_none());
    }

    #[test]
    fn malformed_inputs() {
        let inputs = [
            "",
            "Lo siento, no entendí.",
            "{'respuesta': 'hola', 'step': 1}",
            r#"["respuesta", "step"]"#,
            r#"{"step": 1}"#,
            r#"{"respuesta": 42, "step": 1}"#,
            r#"{"respuesta": "  ", "step": 1}"#,
            r#"{"respuesta": "ok", "step": -1}"#,
            r#"{"respuesta": "ok", "step": "tres"}"#,
            r#"{"respuesta": "ok", "step": [1]}"#,
            r#"{"respuesta": "ok", "step": 1, "Nombre_mascota": 7}"#,
            r#"{"respuesta": "ok", "step": 1} extra"#,
        ];
        for input in inputs {
            let err = interpret(input).unwrap_err();
            match err {
                TurnError::MalformedTurn { raw, .. } => assert_eq!(raw, input),
                other => panic!("unexpected error for {input:?}: {other}"),
            }
        }
    }

    #[test]
    fn missing_step_is_not_malformed() {
        let result = interpret(r#"{"respuesta": "ok"}"#).unwrap();
        assert_eq!(result.step, None);
        let result = interpret(r#"{"respuesta": "ok", "step": null}"#).unwrap();
        assert_eq!(result.step, None);
    }

    #[test]
    fn step_as_string_or_whole_float() {
        assert_eq!(interpret(r#"{"respuesta": "ok", "step": "4"}"#).unwrap().step, Some(4));
        assert_eq!(interpret(r#"{"respuesta": "ok", "step": 3.0}"#).unwrap().step, Some(3));
        assert!(interpret(r#"{"respuesta": "ok", "step": 3.5}"#).is_err());
    }

    #[test]
    fn interval_values() {
        let cases = [
            (r#"9"#, IntervalField::Weeks(9)),
            (r#"0"#, IntervalField::Weeks(0)),
            (r#"8.0"#, IntervalField::Weeks(8)),
            (r#""9""#, IntervalField::Weeks(9)),
            (r#""8 semanas""#, IntervalField::Weeks(8)),
            (r#""2 meses""#, IntervalField::Weeks(9)),
            (r#""1 mes""#, IntervalField::Weeks(4)),
            (r#""14 dias""#, IntervalField::Weeks(2)),
            (r#""10 días""#, IntervalField::Weeks(1)),
            (r#"null"#, IntervalField::Absent),
            (r#""""#, IntervalField::Absent),
            (r#""varias""#, IntervalField::Invalid("varias".into())),
            (r#"-2"#, IntervalField::Invalid("-2".into())),
            (r#"2.5"#, IntervalField::Invalid("2.5".into())),
            (r#"true"#, IntervalField::Invalid("true".into())),
        ];
        for (json, expected) in cases {
            let raw = format!(r#"{{"respuesta": "ok", "step": 3, "intervalo": {json}}}"#);
            let result = interpret(&raw).unwrap();
            assert_eq!(result.interval, expected, "intervalo = {json}");
        }
    }

    #[test]
    fn invalid_interval_keeps_the_rest_of_the_turn() {
        let raw = r#"{"respuesta": "Anotado", "step": 3, "intervalo": "varias"}"#;
        let result = interpret(raw).unwrap();
        assert_eq!(result.reply, "Anotado");
        assert_eq!(result.step, Some(3));
        assert!(matches!(
            result.interval.weeks(),
            Err(TurnError::IntervalCoercion { value }) if value == "varias"
        ));
    }

    #[test]
    fn blank_text_fields_are_absent() {
        let raw = r#"{"respuesta": "ok", "step": 4, "Nombre_mascota": " ", "preferencia": null}"#;
        let result = interpret(raw).unwrap();
        assert!(result.pet_name.is_none());
        assert!(result.preference.is_none());
        assert!(result.profile_update().is_empty());
    }

    #[test]
    fn weeks_from_text_rejects_words() {
        assert_eq!(weeks_from_text("varias"), None);
        assert_eq!(weeks_from_text("dos meses"), None);
        assert_eq!(weeks_from_text("3 años"), None);
        assert_eq!(weeks_from_text("1,5 meses"), Some(7));
    }
}
