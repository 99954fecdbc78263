//! Tool input schemas.
//!
//! A tool's argument schema is described declaratively and emitted as
//! `{type:"object", properties:{...}, required:[...]}`. Fields are required
//! by default; marking a field optional is the analog of omitting it from the
//! required list. Enum lists are legal only on string, integer, and number
//! fields and are always stored as strings; validators downstream coerce
//! scalar values for comparison.
//!
//! Schema construction is deterministic (ordered property maps) and fails
//! fast at build time, so a server can never publish a malformed schema.
//!
//! [`validate`] checks `tools/call` arguments against a schema: types,
//! required fields, enum membership, array items, and nested objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON Schema type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    /// A string.
    String,
    /// An integer.
    Integer,
    /// A floating-point number.
    Number,
    /// A boolean.
    Boolean,
    /// An object; may carry nested properties or be opaque (maps).
    #[default]
    Object,
    /// An array with a single item schema.
    Array,
}

impl PropertyKind {
    fn accepts_enum(self) -> bool {
        matches!(
            self,
            PropertyKind::String | PropertyKind::Integer | PropertyKind::Number
        )
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            PropertyKind::String => value.is_string(),
            PropertyKind::Integer => value.is_i64() || value.is_u64(),
            PropertyKind::Number => value.is_number(),
            PropertyKind::Boolean => value.is_boolean(),
            PropertyKind::Object => value.is_object(),
            PropertyKind::Array => value.is_array(),
        }
    }
}

impl std::fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PropertyKind::String => "string",
            PropertyKind::Integer => "integer",
            PropertyKind::Number => "number",
            PropertyKind::Boolean => "boolean",
            PropertyKind::Object => "object",
            PropertyKind::Array => "array",
        };
        f.write_str(name)
    }
}

/// A single schema property.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Property {
    /// Property type.
    #[serde(rename = "type")]
    pub kind: PropertyKind,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Allowed values, stored as strings regardless of scalar kind.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    /// Nested properties for object kinds; absent for opaque objects.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Property>,
    /// Required nested property names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Item schema for array kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Property>>,
}

/// A tool's input schema: always `{type:"object", ...}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputSchema {
    /// Always [`PropertyKind::Object`].
    #[serde(rename = "type")]
    pub kind: PropertyKind,
    /// Argument properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Property>,
    /// Required argument names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl InputSchema {
    /// Starts a schema builder.
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }
}

/// Error raised when a schema declaration is invalid.
#[derive(Debug, Clone)]
pub struct SchemaError {
    /// The field the violation was found on.
    pub field: String,
    /// What went wrong.
    pub message: String,
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "schema field {:?}: {}", self.field, self.message)
    }
}

impl std::error::Error for SchemaError {}

/// A declared schema field.
///
/// Fields are required unless [`optional`](Field::optional) is called.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    kind: PropertyKind,
    description: Option<String>,
    optional: bool,
    enum_values: Option<Vec<String>>,
    nested: Option<SchemaBuilder>,
    items: Option<Box<Field>>,
}

impl Field {
    fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            optional: false,
            enum_values: None,
            nested: None,
            items: None,
        }
    }

    /// A string field.
    #[must_use]
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::String)
    }

    /// An integer field.
    #[must_use]
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Integer)
    }

    /// A floating-point field.
    #[must_use]
    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Number)
    }

    /// A boolean field.
    #[must_use]
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Boolean)
    }

    /// An object field with nested properties.
    #[must_use]
    pub fn object(name: impl Into<String>, nested: SchemaBuilder) -> Self {
        let mut field = Self::new(name, PropertyKind::Object);
        field.nested = Some(nested);
        field
    }

    /// An opaque object field (a free-form map, no declared properties).
    #[must_use]
    pub fn map(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Object)
    }

    /// An array field; `item` describes the element type (its name is unused).
    #[must_use]
    pub fn array(name: impl Into<String>, item: Field) -> Self {
        let mut field = Self::new(name, PropertyKind::Array);
        field.items = Some(Box::new(item));
        field
    }

    /// Attaches a description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Marks the field optional (it is excluded from `required`).
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Attaches an enum list. Legal only on string, integer, and number
    /// fields; rejected at build time otherwise.
    #[must_use]
    pub fn enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    fn into_property(self) -> Result<(String, Property, bool), SchemaError> {
        if let Some(values) = &self.enum_values {
            if !self.kind.accepts_enum() {
                return Err(SchemaError {
                    field: self.name,
                    message: format!("enum not allowed on kind {}", self.kind),
                });
            }
            if values.is_empty() {
                return Err(SchemaError {
                    field: self.name,
                    message: "enum list is empty".into(),
                });
            }
        }

        let (properties, required) = match self.nested {
            Some(builder) => {
                let schema = builder.build().map_err(|e| SchemaError {
                    field: format!("{}.{}", self.name, e.field),
                    message: e.message,
                })?;
                (schema.properties, schema.required)
            }
            None => (BTreeMap::new(), Vec::new()),
        };

        let items = match self.items {
            Some(item) => {
                let (_, property, _) = item.into_property().map_err(|e| SchemaError {
                    field: format!("{}[{}]", self.name, e.field),
                    message: e.message,
                })?;
                Some(Box::new(property))
            }
            None => None,
        };

        let property = Property {
            kind: self.kind,
            description: self.description,
            enum_values: self.enum_values,
            properties,
            required,
            items,
        };
        Ok((self.name, property, !self.optional))
    }
}

/// Builds an [`InputSchema`] from declared fields.
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    fields: Vec<Field>,
}

impl SchemaBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a field.
    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Builds the schema, failing fast on violations.
    pub fn build(self) -> Result<InputSchema, SchemaError> {
        let mut properties = BTreeMap::new();
        let mut required = Vec::new();
        for field in self.fields {
            let (name, property, is_required) = field.into_property()?;
            if properties.contains_key(&name) {
                return Err(SchemaError {
                    field: name,
                    message: "duplicate field".into(),
                });
            }
            if is_required {
                required.push(name.clone());
            }
            properties.insert(name, property);
        }
        required.sort();
        Ok(InputSchema {
            kind: PropertyKind::Object,
            properties,
            required,
        })
    }
}

/// A single argument-validation failure.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the offending value, e.g. `root.user.age`.
    pub path: String,
    /// What went wrong.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validates tool-call arguments against a schema.
///
/// Returns every violation found rather than stopping at the first.
pub fn validate(schema: &InputSchema, value: &Value) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let Some(object) = value.as_object() else {
        return Err(vec![ValidationError {
            path: "root".into(),
            message: format!("expected object, got {}", type_name(value)),
        }]);
    };
    validate_object(&schema.properties, &schema.required, object, "root", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_object(
    properties: &BTreeMap<String, Property>,
    required: &[String],
    object: &serde_json::Map<String, Value>,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    for name in required {
        if !object.contains_key(name) {
            errors.push(ValidationError {
                path: path.to_string(),
                message: format!("missing required field: {name}"),
            });
        }
    }

    for (name, value) in object {
        let Some(property) = properties.get(name) else {
            continue; // unknown arguments pass through to the handler
        };
        let prop_path = format!("{path}.{name}");
        validate_property(property, value, &prop_path, errors);
    }
}

fn validate_property(property: &Property, value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
    if !property.kind.matches(value) {
        errors.push(ValidationError {
            path: path.to_string(),
            message: format!("expected {}, got {}", property.kind, type_name(value)),
        });
        return;
    }

    if let Some(allowed) = &property.enum_values {
        let candidate = scalar_string(value);
        if !candidate.as_deref().is_some_and(|c| allowed.iter().any(|a| a == c)) {
            errors.push(ValidationError {
                path: path.to_string(),
                message: format!("value must be one of {allowed:?}"),
            });
        }
    }

    match value {
        Value::Object(object) if !property.properties.is_empty() => {
            validate_object(&property.properties, &property.required, object, path, errors);
        }
        Value::Array(items) => {
            if let Some(item_schema) = &property.items {
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{path}[{i}]");
                    validate_property(item_schema, item, &item_path, errors);
                }
            }
        }
        _ => {}
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> InputSchema {
        InputSchema::builder()
            .field(Field::string("string").description("string"))
            .field(Field::number("number").optional())
            .field(Field::string("string4enum").optional().enum_values(["a", "b", "c"]))
            .field(Field::integer("integer4enum").optional().enum_values(["1", "2", "3"]))
            .field(
                Field::number("number4enum")
                    .optional()
                    .enum_values(["1.1", "2.2", "3.3"]),
            )
            .build()
            .expect("valid schema")
    }

    #[test]
    fn builder_required_inference() {
        let schema = sample_schema();
        assert_eq!(schema.required, vec!["string"]);
        assert_eq!(schema.properties.len(), 5);
        assert_eq!(
            schema.properties["string"].description.as_deref(),
            Some("string")
        );
    }

    #[test]
    fn builder_emits_object_schema_json() {
        let value = serde_json::to_value(sample_schema()).unwrap();
        assert_eq!(value["type"], "object");
        assert_eq!(value["properties"]["string"]["type"], "string");
        assert_eq!(value["properties"]["integer4enum"]["enum"][0], "1");
        assert_eq!(value["required"], json!(["string"]));
    }

    #[test]
    fn enum_rejected_on_boolean_and_object_kinds() {
        for field in [
            Field::boolean("flag").enum_values(["a"]),
            Field::map("meta").enum_values(["a"]),
            Field::array("xs", Field::string("item")).enum_values(["a"]),
        ] {
            let err = SchemaBuilder::new().field(field).build().unwrap_err();
            assert!(err.message.contains("enum not allowed"), "{err}");
        }
    }

    #[test]
    fn nested_objects_recurse() {
        let schema = InputSchema::builder()
            .field(Field::string("name").description("user name"))
            .field(Field::integer("age").optional())
            .field(
                Field::object(
                    "address",
                    SchemaBuilder::new()
                        .field(Field::string("city"))
                        .field(Field::string("street").optional()),
                ),
            )
            .build()
            .unwrap();

        assert_eq!(schema.required, vec!["address", "name"]);
        let address = &schema.properties["address"];
        assert_eq!(address.kind, PropertyKind::Object);
        assert_eq!(address.required, vec!["city"]);
        assert_eq!(address.properties["street"].kind, PropertyKind::String);
    }

    #[test]
    fn map_fields_are_opaque_objects() {
        let schema = InputSchema::builder()
            .field(Field::string("name"))
            .field(Field::map("info"))
            .build()
            .unwrap();
        let info = &schema.properties["info"];
        assert_eq!(info.kind, PropertyKind::Object);
        assert!(info.properties.is_empty());
    }

    #[test]
    fn nested_enum_violation_reports_path() {
        let err = InputSchema::builder()
            .field(Field::object(
                "user",
                SchemaBuilder::new().field(Field::boolean("flag").enum_values(["x"])),
            ))
            .build()
            .unwrap_err();
        assert_eq!(err.field, "user.flag");
    }

    #[test]
    fn generation_is_deterministic() {
        let a = serde_json::to_string(&sample_schema()).unwrap();
        let b = serde_json::to_string(&sample_schema()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn validate_types_and_required() {
        let schema = InputSchema::builder()
            .field(Field::string("name"))
            .field(Field::integer("age").optional())
            .build()
            .unwrap();

        assert!(validate(&schema, &json!({"name": "alice"})).is_ok());
        assert!(validate(&schema, &json!({"name": "alice", "age": 30})).is_ok());
        assert!(validate(&schema, &json!({"age": 30})).is_err());
        assert!(validate(&schema, &json!({"name": 1})).is_err());
        assert!(validate(&schema, &json!({"name": "a", "age": 1.5})).is_err());
        assert!(validate(&schema, &json!("not an object")).is_err());
    }

    #[test]
    fn validate_enum_coerces_numbers() {
        let schema = sample_schema();
        assert!(validate(&schema, &json!({"string": "s", "integer4enum": 2})).is_ok());
        assert!(validate(&schema, &json!({"string": "s", "integer4enum": 4})).is_err());
        assert!(validate(&schema, &json!({"string": "s", "number4enum": 2.2})).is_ok());
        assert!(validate(&schema, &json!({"string": "s", "string4enum": "d"})).is_err());
    }

    #[test]
    fn validate_array_items() {
        let schema = InputSchema::builder()
            .field(Field::array("xs", Field::integer("item")))
            .build()
            .unwrap();
        assert!(validate(&schema, &json!({"xs": [1, 2, 3]})).is_ok());
        let errors = validate(&schema, &json!({"xs": [1, "two"]})).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "root.xs[1]");
    }

    #[test]
    fn unknown_arguments_pass_through() {
        let schema = InputSchema::builder().field(Field::string("name")).build().unwrap();
        assert!(validate(&schema, &json!({"name": "x", "extra": 1})).is_ok());
    }
}
