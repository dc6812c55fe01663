// ABOUTME: Coerces an abstract permission decision into a value satisfying a declared JSON schema.
// ABOUTME: Never produces a value whose type contradicts the schema it fills.

use super::{PermissionDecision, PermissionResponse};
use serde_json::{json, Map, Value};

const APPROVE_WORDS: &[&str] = &["allow", "approve", "yes", "true", "accept", "ok", "confirm"];
const DENY_WORDS: &[&str] = &["deny", "no", "false", "reject", "abort", "cancel"];

const DECISION_HINTS: &[&str] = &["decision", "action", "choice", "response", "answer", "outcome"];
const APPROVAL_HINTS: &[&str] = &["approve", "allow", "confirm", "accept", "grant", "permit", "consent"];
const REASON_HINTS: &[&str] = &["reason", "comment", "message", "explanation", "note", "feedback"];

/// Produce the wire value for `response` under an optional declared schema.
///
/// Without a schema (or with an empty one) a small object carrying
/// `decision`, `approved`, `allow` and, when given, `reason` is returned.
pub fn coerce_decision(response: &PermissionResponse, schema: Option<&Value>) -> Value {
    match schema {
        Some(schema) if schema.as_object().is_some_and(|o| !o.is_empty()) => {
            coerce(response, schema)
        }
        _ => default_object(response),
    }
}

fn default_object(response: &PermissionResponse) -> Value {
    let approved = response.decision.is_approval();
    let mut object = Map::new();
    object.insert("decision".into(), json!(response.decision.as_str()));
    object.insert("approved".into(), json!(approved));
    object.insert("allow".into(), json!(approved));
    if let Some(reason) = &response.reason {
        object.insert("reason".into(), json!(reason));
    }
    Value::Object(object)
}

fn coerce(response: &PermissionResponse, schema: &Value) -> Value {
    if let Some(choices) = enum_choices(schema) {
        if !choices.is_empty() {
            return pick_choice(response.decision, &choices);
        }
    }

    let approved = response.decision.is_approval();
    match schema_type(schema) {
        Some("boolean") => json!(approved),
        Some("integer") | Some("number") => json!(if approved { 1 } else { 0 }),
        Some("string") => json!(response.decision.as_str()),
        Some("null") => Value::Null,
        Some("array") => {
            let item = match schema.get("items") {
                Some(items) if items.is_object() => coerce(response, items),
                _ => json!(response.decision.as_str()),
            };
            json!([item])
        }
        Some("object") => coerce_object(response, schema),
        _ if schema.get("properties").is_some() => coerce_object(response, schema),
        _ => json!(response.decision.as_str()),
    }
}

fn coerce_object(response: &PermissionResponse, schema: &Value) -> Value {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return default_object(response);
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut filled = Map::new();

    for (name, prop_schema) in properties {
        let lower = name.to_lowercase();
        if contains_any(&lower, DECISION_HINTS) || contains_any(&lower, APPROVAL_HINTS) {
            filled.insert(name.clone(), coerce(response, prop_schema));
        } else if contains_any(&lower, REASON_HINTS) {
            if let Some(reason) = &response.reason {
                if accepts_string(prop_schema) {
                    filled.insert(name.clone(), json!(reason));
                }
            }
        }
    }

    for name in &required {
        if filled.contains_key(*name) {
            continue;
        }
        if let Some(prop_schema) = properties.get(*name) {
            filled.insert(name.to_string(), coerce(response, prop_schema));
        }
    }

    if filled.is_empty() {
        let first = required
            .iter()
            .find_map(|name| properties.get_key_value(*name))
            .or_else(|| properties.iter().next());
        if let Some((name, prop_schema)) = first {
            filled.insert(name.clone(), coerce(response, prop_schema));
        }
    }

    Value::Object(filled)
}

/// Literal choices declared via `enum`, or `oneOf`/`anyOf` of `const`s
fn enum_choices(schema: &Value) -> Option<Vec<Value>> {
    if let Some(values) = schema.get("enum").and_then(Value::as_array) {
        return Some(values.clone());
    }
    for key in ["oneOf", "anyOf"] {
        if let Some(variants) = schema.get(key).and_then(Value::as_array) {
            let consts: Vec<Value> = variants
                .iter()
                .filter_map(|variant| variant.get("const").cloned())
                .collect();
            if !consts.is_empty() && consts.len() == variants.len() {
                return Some(consts);
            }
        }
    }
    None
}

fn pick_choice(decision: PermissionDecision, choices: &[Value]) -> Value {
    if let Some(exact) = choices
        .iter()
        .find(|choice| choice.as_str() == Some(decision.as_str()))
    {
        return exact.clone();
    }

    let words = if decision.is_approval() {
        APPROVE_WORDS
    } else {
        DENY_WORDS
    };
    if let Some(fuzzy) = choices
        .iter()
        .find(|choice| matches_keyword(&literal_text(choice), words))
    {
        return fuzzy.clone();
    }

    let fallback = if decision.is_approval() {
        choices.first()
    } else {
        choices.last()
    };
    fallback.cloned().unwrap_or(Value::Null)
}

fn literal_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

/// Endings accepted after a keyword stem, as in `allowed` or `cancelled`
const INFLECTIONS: &[&str] = &["s", "d", "ed", "led", "ing", "ance"];

/// A word of `text` (split on non-alphanumerics) is one of `keywords`.
///
/// Stems of four or more letters also match their inflected forms; short
/// keywords like `no` and `ok` only match whole words.
fn matches_keyword(text: &str, keywords: &[&str]) -> bool {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .any(|word| keywords.iter().any(|keyword| is_word_form(word, keyword)))
}

fn is_word_form(word: &str, keyword: &str) -> bool {
    match word.strip_prefix(keyword) {
        Some("") => true,
        Some(ending) => keyword.len() >= 4 && INFLECTIONS.contains(&ending),
        None => false,
    }
}

fn contains_any(name: &str, hints: &[&str]) -> bool {
    hints.iter().any(|hint| name.contains(hint))
}

/// First non-null declared type
fn schema_type(schema: &Value) -> Option<&str> {
    match schema.get("type")? {
        Value::String(t) => Some(t.as_str()),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .or(Some("null")),
        _ => None,
    }
}

fn accepts_string(schema: &Value) -> bool {
    if enum_choices(schema).is_some() {
        return false;
    }
    match schema.get("type") {
        None => true,
        Some(Value::String(t)) => t == "string",
        Some(Value::Array(types)) => types.iter().any(|t| t == "string"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide(decision: PermissionDecision, schema: Value) -> Value {
        coerce_decision(&decision.into(), Some(&schema))
    }

    #[test]
    fn test_boolean_schema() {
        let schema = json!({"type": "boolean"});
        assert_eq!(decide(PermissionDecision::Approved, schema.clone()), json!(true));
        assert_eq!(decide(PermissionDecision::ApprovedForSession, schema.clone()), json!(true));
        assert_eq!(decide(PermissionDecision::Denied, schema.clone()), json!(false));
        assert_eq!(decide(PermissionDecision::Abort, schema), json!(false));
    }

    #[test]
    fn test_enum_fuzzy_match() {
        let schema = json!({"enum": ["allow", "deny"]});
        assert_eq!(decide(PermissionDecision::ApprovedForSession, schema.clone()), json!("allow"));
        assert_eq!(decide(PermissionDecision::Denied, schema.clone()), json!("deny"));
        assert_eq!(decide(PermissionDecision::Abort, schema), json!("deny"));
    }

    #[test]
    fn test_enum_keywords_match_whole_words() {
        let schema = json!({"enum": ["now", "okay_later", "allowed", "cancelled"]});
        assert_eq!(decide(PermissionDecision::Approved, schema.clone()), json!("allowed"));
        assert_eq!(decide(PermissionDecision::Denied, schema), json!("cancelled"));

        // No whole-word keyword: fall back to first/last
        let schema = json!({"enum": ["now", "none", "normal"]});
        assert_eq!(decide(PermissionDecision::Denied, schema.clone()), json!("normal"));
        let schema = json!({"enum": ["okay_later", "never"]});
        assert_eq!(decide(PermissionDecision::Approved, schema), json!("okay_later"));

        assert!(matches_keyword("allow_once", APPROVE_WORDS));
        assert!(matches_keyword("reject-always", DENY_WORDS));
        assert!(!matches_keyword("none", DENY_WORDS));
        assert!(!matches_keyword("okay", APPROVE_WORDS));
    }

    #[test]
    fn test_enum_exact_match_wins() {
        let schema = json!({"enum": ["allow", "approved_for_session", "deny"]});
        assert_eq!(
            decide(PermissionDecision::ApprovedForSession, schema),
            json!("approved_for_session")
        );
    }

    #[test]
    fn test_enum_defaults_first_and_last() {
        let schema = json!({"enum": ["alpha", "beta", "gamma"]});
        assert_eq!(decide(PermissionDecision::Approved, schema.clone()), json!("alpha"));
        assert_eq!(decide(PermissionDecision::Denied, schema), json!("gamma"));
    }

    #[test]
    fn test_one_of_consts() {
        let schema = json!({"oneOf": [{"const": "accept", "title": "Yes"}, {"const": "decline"}, {"const": "cancel"}]});
        assert_eq!(decide(PermissionDecision::Approved, schema.clone()), json!("accept"));
        assert_eq!(decide(PermissionDecision::Abort, schema), json!("cancel"));
    }

    #[test]
    fn test_scalar_types() {
        assert_eq!(decide(PermissionDecision::Approved, json!({"type": "integer"})), json!(1));
        assert_eq!(decide(PermissionDecision::Denied, json!({"type": "number"})), json!(0));
        assert_eq!(
            decide(PermissionDecision::Denied, json!({"type": "string"})),
            json!("denied")
        );
    }

    #[test]
    fn test_array_schema() {
        assert_eq!(
            decide(
                PermissionDecision::Approved,
                json!({"type": "array", "items": {"enum": ["yes", "no"]}})
            ),
            json!(["yes"])
        );
        assert_eq!(
            decide(PermissionDecision::Denied, json!({"type": "array", "items": {"type": "string"}})),
            json!(["denied"])
        );
        assert_eq!(
            decide(PermissionDecision::Denied, json!({"type": "array"})),
            json!(["denied"])
        );
    }

    #[test]
    fn test_object_fills_hinted_and_required() {
        let schema = json!({
            "type": "object",
            "properties": {
                "approved": {"type": "boolean"},
                "reason": {"type": "string"},
                "scope": {"type": "string", "enum": ["once", "session"]},
                "ttl": {"type": "integer"}
            },
            "required": ["approved", "ttl"]
        });
        let response = PermissionResponse::with_reason(PermissionDecision::Approved, "looks safe");
        let value = coerce_decision(&response, Some(&schema));
        assert_eq!(value, json!({"approved": true, "reason": "looks safe", "ttl": 1}));
    }

    #[test]
    fn test_object_reason_skipped_when_not_string_typed() {
        let schema = json!({
            "type": "object",
            "properties": {"decision": {"type": "boolean"}, "reason_code": {"type": "integer"}}
        });
        let response = PermissionResponse::with_reason(PermissionDecision::Denied, "nope");
        assert_eq!(coerce_decision(&response, Some(&schema)), json!({"decision": false}));
    }

    #[test]
    fn test_object_never_empty() {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}, "count": {"type": "integer"}}
        });
        assert_eq!(
            decide(PermissionDecision::Approved, schema),
            json!({"path": "approved"})
        );

        let required_first = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}, "count": {"type": "integer"}},
            "required": ["count"]
        });
        assert_eq!(decide(PermissionDecision::Denied, required_first), json!({"count": 0}));
    }

    #[test]
    fn test_no_schema_default_object() {
        let response = PermissionResponse::with_reason(PermissionDecision::Denied, "risky");
        assert_eq!(
            coerce_decision(&response, None),
            json!({"decision": "denied", "approved": false, "allow": false, "reason": "risky"})
        );
        assert_eq!(
            coerce_decision(&PermissionDecision::Approved.into(), Some(&json!({}))),
            json!({"decision": "approved", "approved": true, "allow": true})
        );
    }

    #[test]
    fn test_filled_properties_respect_declared_types() {
        let schema = json!({
            "type": "object",
            "properties": {
                "allow": {"type": "boolean"},
                "confirm_count": {"type": "integer"},
                "action": {"type": "string", "enum": ["accept", "decline"]},
                "answers": {"type": "array", "items": {"type": "boolean"}}
            },
            "required": ["answers"]
        });
        for decision in [
            PermissionDecision::Approved,
            PermissionDecision::ApprovedForSession,
            PermissionDecision::Denied,
            PermissionDecision::Abort,
        ] {
            let value = decide(decision, schema.clone());
            assert!(value["allow"].is_boolean());
            assert!(value["confirm_count"].is_i64());
            assert!(value["action"].is_string());
            assert!(value["answers"][0].is_boolean());
        }
    }
}
