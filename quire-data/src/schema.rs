//! Declarative field descriptors.
//!
//! A [`FieldDescriptor`] is an immutable builder: every modifier returns a new
//! descriptor. Descriptors validate and coerce incoming values and tell the
//! runtime how a field is stored.

use std::fmt;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::value::Value;

// Literal patterns: compiling them cannot fail at runtime.
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern")
});

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://[^\s/?#]+[^\s]*$").expect("url pattern")
});

/// Semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Date,
    Uuid,
    /// Semi-structured JSON object.
    Object,
    /// Ordered list, stored as a JSON array.
    Array,
}

impl FieldKind {
    pub fn name(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::Uuid => "uuid",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }

    /// Whether values of this kind are compared structurally when computing
    /// changed fields.
    pub fn is_structured(self) -> bool {
        matches!(self, FieldKind::Object | FieldKind::Array)
    }

    /// Coerce a value into this kind, or describe why it cannot be.
    pub fn coerce(self, value: Value) -> Result<Value, String> {
        let mismatch = |v: &Value| format!("expected {}, got {}", self.name(), v.type_name());
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (FieldKind::String, Value::Text(s)) => Ok(Value::Text(s)),
            (FieldKind::String, Value::Uuid(u)) => Ok(Value::Text(u.to_string())),
            (FieldKind::Integer, Value::Int(i)) => Ok(Value::Int(i)),
            (FieldKind::Integer, Value::Float(f)) if f.fract() == 0.0 => Ok(Value::Int(f as i64)),
            (FieldKind::Number, Value::Float(f)) => Ok(Value::Float(f)),
            (FieldKind::Number, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (FieldKind::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
            (FieldKind::Date, Value::Date(d)) => Ok(Value::Date(d)),
            (FieldKind::Date, Value::Text(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|d| Value::Date(d.with_timezone(&Utc)))
                .map_err(|e| format!("invalid date `{s}`: {e}")),
            (FieldKind::Uuid, Value::Uuid(u)) => Ok(Value::Uuid(u)),
            (FieldKind::Uuid, Value::Text(s)) => Uuid::parse_str(&s)
                .map(Value::Uuid)
                .map_err(|e| format!("invalid uuid `{s}`: {e}")),
            (FieldKind::Object, Value::Json(j)) if j.is_object() => Ok(Value::Json(j)),
            (FieldKind::Array, Value::Array(items)) => Ok(Value::Array(items)),
            (FieldKind::Array, Value::Json(serde_json::Value::Array(items))) => Ok(Value::Array(
                items.into_iter().map(Value::from_json).collect(),
            )),
            (_, other) => Err(mismatch(&other)),
        }
    }
}

/// String format constraint.
#[derive(Debug, Clone)]
pub enum Format {
    Email,
    Url,
    Pattern(Regex),
}

impl Format {
    fn check(&self, s: &str) -> bool {
        match self {
            Format::Email => EMAIL.is_match(s),
            Format::Url => URL.is_match(s),
            Format::Pattern(re) => re.is_match(s),
        }
    }

    fn describe(&self) -> String {
        match self {
            Format::Email => "an email address".to_string(),
            Format::Url => "a URL".to_string(),
            Format::Pattern(re) => format!("a string matching `{}`", re.as_str()),
        }
    }
}

/// Default-value policy applied when a new record omits the field.
#[derive(Clone, Default)]
pub enum DefaultPolicy {
    #[default]
    None,
    Value(Value),
    With(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl DefaultPolicy {
    pub fn produce(&self) -> Option<Value> {
        match self {
            DefaultPolicy::None => None,
            DefaultPolicy::Value(v) => Some(v.clone()),
            DefaultPolicy::With(f) => Some(f()),
        }
    }
}

impl fmt::Debug for DefaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultPolicy::None => f.write_str("None"),
            DefaultPolicy::Value(v) => f.debug_tuple("Value").field(v).finish(),
            DefaultPolicy::With(_) => f.write_str("With(<fn>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    kind: FieldKind,
    required: bool,
    max: Option<f64>,
    min: Option<f64>,
    one_of: Vec<Value>,
    format: Option<Format>,
    items: Option<FieldKind>,
    default: DefaultPolicy,
    sensitive: bool,
    is_virtual: bool,
}

impl FieldDescriptor {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            max: None,
            min: None,
            one_of: Vec::new(),
            format: None,
            items: None,
            default: DefaultPolicy::None,
            sensitive: false,
            is_virtual: false,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldKind::String)
    }

    pub fn integer() -> Self {
        Self::new(FieldKind::Integer)
    }

    pub fn number() -> Self {
        Self::new(FieldKind::Number)
    }

    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    pub fn date() -> Self {
        Self::new(FieldKind::Date)
    }

    pub fn uuid() -> Self {
        Self::new(FieldKind::Uuid)
    }

    pub fn object() -> Self {
        Self::new(FieldKind::Object)
    }

    pub fn array(items: FieldKind) -> Self {
        Self::new(FieldKind::Array).items(items)
    }

    /// A computed field: never persisted, filled by the manifest's virtual
    /// value generator after every load and save.
    pub fn virtual_of(kind: FieldKind) -> Self {
        Self {
            is_virtual: true,
            ..Self::new(kind)
        }
    }

    pub fn required(self) -> Self {
        Self {
            required: true,
            ..self
        }
    }

    /// Upper bound: character count for strings, value for numbers, length
    /// for arrays.
    pub fn max(self, max: impl Into<f64>) -> Self {
        Self {
            max: Some(max.into()),
            ..self
        }
    }

    pub fn min(self, min: impl Into<f64>) -> Self {
        Self {
            min: Some(min.into()),
            ..self
        }
    }

    /// Restrict values to an enumerated set.
    pub fn one_of<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            one_of: values.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn format(self, format: Format) -> Self {
        Self {
            format: Some(format),
            ..self
        }
    }

    pub fn items(self, kind: FieldKind) -> Self {
        Self {
            items: Some(kind),
            ..self
        }
    }

    pub fn default_value(self, value: impl Into<Value>) -> Self {
        Self {
            default: DefaultPolicy::Value(value.into()),
            ..self
        }
    }

    pub fn default_with(self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self {
            default: DefaultPolicy::With(Arc::new(f)),
            ..self
        }
    }

    /// Exclude the field from default projections.
    pub fn sensitive(self) -> Self {
        Self {
            sensitive: true,
            ..self
        }
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn item_kind(&self) -> Option<FieldKind> {
        self.items
    }

    pub fn default_policy(&self) -> &DefaultPolicy {
        &self.default
    }

    /// Validate `value` for `field`, returning the coerced value.
    pub fn validate(&self, field: &str, value: Value) -> Result<Value, ValidationError> {
        let fail = |message: String| ValidationError::new(field, message);

        if value.is_null() {
            return if self.required {
                Err(fail("is required".into()))
            } else {
                Ok(Value::Null)
            };
        }

        let value = self.kind.coerce(value).map_err(fail)?;

        if !self.one_of.is_empty() && !self.one_of.contains(&value) {
            let allowed: Vec<String> = self.one_of.iter().map(|v| v.to_json().to_string()).collect();
            return Err(fail(format!("must be one of [{}]", allowed.join(", "))));
        }

        match &value {
            Value::Text(s) => {
                let len = s.chars().count() as f64;
                self.check_bounds(len, "length").map_err(fail)?;
                if let Some(format) = &self.format {
                    if !format.check(s) {
                        return Err(fail(format!("must be {}", format.describe())));
                    }
                }
            }
            Value::Int(i) => self.check_bounds(*i as f64, "value").map_err(fail)?,
            Value::Float(f) => self.check_bounds(*f, "value").map_err(fail)?,
            Value::Array(items) => {
                self.check_bounds(items.len() as f64, "length").map_err(fail)?;
                if let Some(item_kind) = self.items {
                    let coerced = items
                        .iter()
                        .cloned()
                        .enumerate()
                        .map(|(idx, item)| {
                            item_kind
                                .coerce(item)
                                .map_err(|e| fail(format!("item {idx}: {e}")))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Value::Array(coerced));
                }
            }
            _ => {}
        }

        Ok(value)
    }

    fn check_bounds(&self, measured: f64, what: &str) -> Result<(), String> {
        if let Some(max) = self.max {
            if measured > max {
                return Err(format!("{what} must be at most {max}"));
            }
        }
        if let Some(min) = self.min {
            if measured < min {
                return Err(format!("{what} must be at least {min}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_rejects_null() {
        let d = FieldDescriptor::string().required();
        let err = d.validate("label", Value::Null).unwrap_err();
        assert_eq!(err.field, "label");
        assert_eq!(err.message, "is required");
        assert_eq!(FieldDescriptor::string().validate("label", Value::Null), Ok(Value::Null));
    }

    #[test]
    fn test_modifiers_do_not_mutate_the_original() {
        let base = FieldDescriptor::string();
        let strict = base.clone().required().max(3);
        assert!(!base.is_required());
        assert!(strict.is_required());
        assert!(base.validate("s", "long string".into()).is_ok());
        assert!(strict.validate("s", "long string".into()).is_err());
    }

    #[test]
    fn test_max_counts_characters() {
        let d = FieldDescriptor::string().max(3);
        assert!(d.validate("s", "héé".into()).is_ok());
        assert!(d.validate("s", "abcd".into()).is_err());
    }

    #[test]
    fn test_numeric_bounds_and_coercion() {
        let d = FieldDescriptor::number().min(0).max(10);
        assert_eq!(d.validate("n", Value::Int(5)), Ok(Value::Float(5.0)));
        assert!(d.validate("n", Value::Float(10.5)).is_err());
        assert!(d.validate("n", Value::Int(-1)).is_err());
        assert!(d.validate("n", Value::Text("5".into())).is_err());
    }

    #[test]
    fn test_enumerations() {
        let d = FieldDescriptor::string().one_of(["draft", "published"]);
        assert!(d.validate("status", "draft".into()).is_ok());
        let err = d.validate("status", "archived".into()).unwrap_err();
        assert!(err.message.contains("must be one of"));
    }

    #[test]
    fn test_formats() {
        let email = FieldDescriptor::string().format(Format::Email);
        assert!(email.validate("email", "a@b.io".into()).is_ok());
        assert!(email.validate("email", "not-an-email".into()).is_err());

        let url = FieldDescriptor::string().format(Format::Url);
        assert!(url.validate("url", "https://example.org/x?y=1".into()).is_ok());
        assert!(url.validate("url", "example.org".into()).is_err());

        let slug = FieldDescriptor::string().format(Format::Pattern(Regex::new("^[a-z-]+$").unwrap()));
        assert!(slug.validate("slug", "a-slug".into()).is_ok());
        assert!(slug.validate("slug", "Not A Slug".into()).is_err());
    }

    #[test]
    fn test_text_coerces_to_uuid_and_date() {
        let id = Uuid::new_v4();
        assert_eq!(
            FieldDescriptor::uuid().validate("id", Value::Text(id.to_string())),
            Ok(Value::Uuid(id))
        );
        let date = FieldDescriptor::date()
            .validate("at", "2024-01-02T03:04:05Z".into())
            .unwrap();
        assert!(matches!(date, Value::Date(_)));
        assert!(FieldDescriptor::uuid().validate("id", "nope".into()).is_err());
    }

    #[test]
    fn test_array_items_are_checked() {
        let d = FieldDescriptor::array(FieldKind::String).max(2);
        assert!(d.validate("tags", Value::from(vec!["a", "b"])).is_ok());
        assert!(d.validate("tags", Value::from(vec!["a", "b", "c"])).is_err());
        let err = d.validate("tags", Value::from(vec![1i64])).unwrap_err();
        assert!(err.message.starts_with("item 0"));
    }

    #[test]
    fn test_objects_must_be_json_objects() {
        let d = FieldDescriptor::object();
        assert!(d.validate("meta", serde_json::json!({"a": 1}).into()).is_ok());
        assert!(d.validate("meta", serde_json::json!([1]).into()).is_err());
    }

    #[test]
    fn test_default_policies() {
        let fixed = FieldDescriptor::integer().default_value(7);
        assert_eq!(fixed.default_policy().produce(), Some(Value::Int(7)));
        let computed = FieldDescriptor::uuid().default_with(|| Value::Uuid(Uuid::nil()));
        assert_eq!(computed.default_policy().produce(), Some(Value::Uuid(Uuid::nil())));
        assert_eq!(FieldDescriptor::string().default_policy().produce(), None);
    }
}
