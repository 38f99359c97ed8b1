//! Per-model request body rewrites.
//!
//! Rules are data: a pattern on the model name, an optional rename, and a list of
//! body operations. Supporting a new model means adding a rule, not a branch.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue, json};

pub type BodyFn = Arc<dyn Fn(&mut Map<String, JsonValue>) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelPattern {
    Any,
    Exact(String),
    Prefix(String),
    Contains(String),
}

impl ModelPattern {
    pub fn exact(model: impl Into<String>) -> Self {
        ModelPattern::Exact(model.into())
    }

    pub fn contains(fragment: impl Into<String>) -> Self {
        ModelPattern::Contains(fragment.into())
    }

    pub fn matches(&self, model: &str) -> bool {
        match self {
            ModelPattern::Any => true,
            ModelPattern::Exact(name) => model == name,
            ModelPattern::Prefix(prefix) => model.starts_with(prefix.as_str()),
            ModelPattern::Contains(fragment) => model.contains(fragment.as_str()),
        }
    }
}

/// Field paths are dot separated: `generationConfig.thinkingConfig`.
#[derive(Clone)]
pub enum BodyOp {
    /// Inserts `{}` when the field is missing. An existing value is kept as is.
    EnsureObject(String),
    /// Sets the field, creating missing parent objects.
    Set(String, JsonValue),
    Remove(String),
    Rename { from: String, to: String },
    /// For every object in the array, inserts `field: value` when it is missing.
    DefaultInArray {
        array: String,
        field: String,
        value: JsonValue,
    },
    Custom(BodyFn),
}

impl BodyOp {
    pub fn ensure_object(path: &str) -> Self {
        BodyOp::EnsureObject(path.to_string())
    }

    pub fn set(path: &str, value: JsonValue) -> Self {
        BodyOp::Set(path.to_string(), value)
    }

    pub fn remove(path: &str) -> Self {
        BodyOp::Remove(path.to_string())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&mut Map<String, JsonValue>) + Send + Sync + 'static,
    {
        BodyOp::Custom(Arc::new(f))
    }

    fn apply(&self, body: &mut Map<String, JsonValue>) {
        match self {
            BodyOp::EnsureObject(path) => {
                let (parent, leaf) = split_path(path);
                if let Some(obj) = object_at_mut(body, &parent, true)
                    && !obj.contains_key(leaf)
                {
                    obj.insert(leaf.to_string(), JsonValue::Object(Map::new()));
                }
            }
            BodyOp::Set(path, value) => {
                let (parent, leaf) = split_path(path);
                if let Some(obj) = object_at_mut(body, &parent, true) {
                    obj.insert(leaf.to_string(), value.clone());
                }
            }
            BodyOp::Remove(path) => {
                take_field(body, path);
            }
            BodyOp::Rename { from, to } => {
                if let Some(value) = take_field(body, from) {
                    let (parent, leaf) = split_path(to);
                    if let Some(obj) = object_at_mut(body, &parent, true) {
                        obj.insert(leaf.to_string(), value);
                    }
                }
            }
            BodyOp::DefaultInArray {
                array,
                field,
                value,
            } => {
                let (parent, leaf) = split_path(array);
                let Some(items) = object_at_mut(body, &parent, false)
                    .and_then(|obj| obj.get_mut(leaf))
                    .and_then(JsonValue::as_array_mut)
                else {
                    return;
                };
                for item in items.iter_mut().filter_map(JsonValue::as_object_mut) {
                    if !item.contains_key(field) {
                        item.insert(field.clone(), value.clone());
                    }
                }
            }
            BodyOp::Custom(f) => f(body),
        }
    }
}

impl fmt::Debug for BodyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyOp::EnsureObject(path) => f.debug_tuple("EnsureObject").field(path).finish(),
            BodyOp::Set(path, value) => f.debug_tuple("Set").field(path).field(value).finish(),
            BodyOp::Remove(path) => f.debug_tuple("Remove").field(path).finish(),
            BodyOp::Rename { from, to } => f
                .debug_struct("Rename")
                .field("from", from)
                .field("to", to)
                .finish(),
            BodyOp::DefaultInArray {
                array,
                field,
                value,
            } => f
                .debug_struct("DefaultInArray")
                .field("array", array)
                .field("field", field)
                .field("value", value)
                .finish(),
            BodyOp::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub pattern: ModelPattern,
    /// Replaces the matched model name (the whole name for `Exact`/`Prefix`/`Any`,
    /// the fragment for `Contains`).
    pub rename: Option<String>,
    pub ops: Vec<BodyOp>,
}

impl RewriteRule {
    pub fn new(pattern: ModelPattern) -> Self {
        Self {
            pattern,
            rename: None,
            ops: Vec::new(),
        }
    }

    pub fn rename_to(mut self, model: impl Into<String>) -> Self {
        self.rename = Some(model.into());
        self
    }

    pub fn op(mut self, op: BodyOp) -> Self {
        self.ops.push(op);
        self
    }

    fn renamed(&self, model: &str) -> Option<String> {
        let target = self.rename.as_deref()?;
        match &self.pattern {
            ModelPattern::Contains(fragment) => Some(model.replace(fragment.as_str(), target)),
            _ => Some(target.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RewriteTable {
    rules: Vec<RewriteRule>,
}

impl RewriteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: RewriteRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    /// The rules Vertex Express needs for Gemini API bodies.
    pub fn vertex_defaults() -> Self {
        Self::new()
            .with_rule(
                RewriteRule::new(ModelPattern::contains("gemini-2.0-flash-exp-image-generation"))
                    .rename_to("gemini-2.5-flash-image-preview"),
            )
            .with_rule(
                RewriteRule::new(ModelPattern::Any).op(BodyOp::ensure_object("generationConfig")),
            )
            .with_rule(
                RewriteRule::new(ModelPattern::contains("gemini-2.5-flash-image-preview"))
                    .op(BodyOp::remove("generationConfig.thinkingConfig"))
                    .op(BodyOp::remove("generationConfig.responseMimeType"))
                    .op(BodyOp::set(
                        "generationConfig.responseModalities",
                        json!(["TEXT", "IMAGE"]),
                    )),
            )
            .with_rule(
                RewriteRule::new(ModelPattern::Any).op(BodyOp::DefaultInArray {
                    array: "contents".to_string(),
                    field: "role".to_string(),
                    value: json!("user"),
                }),
            )
            .with_rule(
                RewriteRule::new(ModelPattern::Any)
                    .op(BodyOp::set("safetySettings", block_none_safety_settings())),
            )
    }

    /// Applies renames only and returns the model to call.
    pub fn resolve_model(&self, model: &str) -> String {
        let mut model = model.to_string();
        for rule in &self.rules {
            if rule.pattern.matches(&model)
                && let Some(renamed) = rule.renamed(&model)
            {
                model = renamed;
            }
        }
        model
    }

    /// Applies every matching rule in order and returns the model to call.
    ///
    /// A rename is visible to the rules after it.
    pub fn apply(&self, model: &str, body: &mut Map<String, JsonValue>) -> String {
        let mut model = model.to_string();
        for rule in &self.rules {
            if !rule.pattern.matches(&model) {
                continue;
            }
            if let Some(renamed) = rule.renamed(&model) {
                model = renamed;
            }
            for op in &rule.ops {
                op.apply(body);
            }
        }
        model
    }
}

const HARM_CATEGORIES: [&str; 8] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_IMAGE_HATE",
    "HARM_CATEGORY_IMAGE_DANGEROUS_CONTENT",
    "HARM_CATEGORY_IMAGE_HARASSMENT",
    "HARM_CATEGORY_IMAGE_SEXUALLY_EXPLICIT",
];

fn block_none_safety_settings() -> JsonValue {
    JsonValue::Array(
        HARM_CATEGORIES
            .iter()
            .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
            .collect(),
    )
}

fn split_path(path: &str) -> (Vec<&str>, &str) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let leaf = parts.pop().unwrap_or_default();
    (parts, leaf)
}

fn object_at_mut<'a>(
    body: &'a mut Map<String, JsonValue>,
    parents: &[&str],
    create: bool,
) -> Option<&'a mut Map<String, JsonValue>> {
    let mut current = body;
    for key in parents {
        if create && !current.contains_key(*key) {
            current.insert((*key).to_string(), JsonValue::Object(Map::new()));
        }
        current = current.get_mut(*key)?.as_object_mut()?;
    }
    Some(current)
}

fn take_field(body: &mut Map<String, JsonValue>, path: &str) -> Option<JsonValue> {
    let (parent, leaf) = split_path(path);
    object_at_mut(body, &parent, false)?.remove(leaf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn stream_flag_rule_only_touches_its_model() {
        let table = RewriteTable::new().with_rule(
            RewriteRule::new(ModelPattern::exact("modelX")).op(BodyOp::set("stream", json!(true))),
        );

        let mut body = object(json!({ "prompt": "hi" }));
        assert_eq!(table.apply("modelX", &mut body), "modelX");
        assert_eq!(JsonValue::Object(body), json!({ "prompt": "hi", "stream": true }));

        let mut body = object(json!({ "prompt": "hi" }));
        assert_eq!(table.apply("modelY", &mut body), "modelY");
        assert_eq!(JsonValue::Object(body), json!({ "prompt": "hi" }));
    }

    #[test]
    fn image_generation_alias_gets_image_preview_rules() {
        let table = RewriteTable::vertex_defaults();
        let mut body = object(json!({
            "contents": [{ "parts": [{ "text": "draw" }] }, { "role": "model", "parts": [] }],
            "generationConfig": {
                "thinkingConfig": { "thinkingBudget": 0 },
                "responseMimeType": "application/json",
                "temperature": 0.5
            }
        }));
        let model = table.apply("gemini-2.0-flash-exp-image-generation", &mut body);
        assert_eq!(model, "gemini-2.5-flash-image-preview");
        assert_eq!(
            body["generationConfig"],
            json!({ "temperature": 0.5, "responseModalities": ["TEXT", "IMAGE"] })
        );
        assert_eq!(body["contents"][0]["role"], json!("user"));
        assert_eq!(body["contents"][1]["role"], json!("model"));
        assert_eq!(body["safetySettings"].as_array().map(Vec::len), Some(8));
    }

    #[test]
    fn defaults_add_generation_config_and_safety_settings() {
        let table = RewriteTable::vertex_defaults();
        let mut body = object(json!({ "contents": [] }));
        let model = table.apply("gemini-2.5-pro", &mut body);
        assert_eq!(model, "gemini-2.5-pro");
        assert_eq!(body["generationConfig"], json!({}));
        assert_eq!(
            body["safetySettings"][0],
            json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE" })
        );
    }

    #[test]
    fn rename_and_nested_set_create_parents() {
        let table = RewriteTable::new().with_rule(
            RewriteRule::new(ModelPattern::Prefix("legacy-".to_string()))
                .rename_to("modern")
                .op(BodyOp::Rename {
                    from: "maxTokens".to_string(),
                    to: "generationConfig.maxOutputTokens".to_string(),
                }),
        );
        let mut body = object(json!({ "maxTokens": 16 }));
        assert_eq!(table.apply("legacy-1", &mut body), "modern");
        assert_eq!(
            JsonValue::Object(body),
            json!({ "generationConfig": { "maxOutputTokens": 16 } })
        );
        assert_eq!(table.resolve_model("legacy-2"), "modern");
    }

    #[test]
    fn set_under_non_object_parent_is_ignored() {
        let table = RewriteTable::new().with_rule(
            RewriteRule::new(ModelPattern::Any)
                .op(BodyOp::set("generationConfig.responseModalities", json!(["TEXT"]))),
        );
        let mut body = object(json!({ "generationConfig": "oops" }));
        table.apply("m", &mut body);
        assert_eq!(body["generationConfig"], json!("oops"));
    }

    #[test]
    fn custom_ops_run_in_order() {
        let table = RewriteTable::new().with_rule(
            RewriteRule::new(ModelPattern::Any)
                .op(BodyOp::set("n", json!(1)))
                .op(BodyOp::custom(|body| {
                    let n = body.get("n").and_then(JsonValue::as_i64).unwrap_or(0);
                    body.insert("n".to_string(), json!(n * 10));
                })),
        );
        let mut body = Map::new();
        table.apply("m", &mut body);
        assert_eq!(body["n"], json!(10));
    }
}
