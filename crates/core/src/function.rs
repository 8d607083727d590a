//! Declared functions: the typed tools a model may call during a turn.
//!
//! A [`FunctionRegistry`] is rebuilt from the active conversation context at
//! the start of every turn. Names are unique within one registry; declaring
//! the same name twice is rejected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use crate::error::FunctionError;

/// Primitive parameter types understood by the model service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParameterType {
    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Parameter schema for a declared function.
///
/// The registry never validates arguments against it; the schema is only
/// forwarded to the model service, which shapes the generated calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub kind: ParameterType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub nullable: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, ParameterSchema>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParameterSchema>>,
}

impl ParameterSchema {
    fn of(kind: ParameterType, description: &str) -> Self {
        Self {
            kind,
            description: description.to_string(),
            nullable: false,
            properties: BTreeMap::new(),
            required: Vec::new(),
            items: None,
        }
    }

    /// An object with no properties yet.
    pub fn object() -> Self {
        Self::of(ParameterType::Object, "")
    }

    pub fn string(description: &str) -> Self {
        Self::of(ParameterType::String, description)
    }

    pub fn integer(description: &str) -> Self {
        Self::of(ParameterType::Integer, description)
    }

    pub fn number(description: &str) -> Self {
        Self::of(ParameterType::Number, description)
    }

    pub fn boolean(description: &str) -> Self {
        Self::of(ParameterType::Boolean, description)
    }

    pub fn array(description: &str, items: ParameterSchema) -> Self {
        let mut schema = Self::of(ParameterType::Array, description);
        schema.items = Some(Box::new(items));
        schema
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Add an object property.
    pub fn property(mut self, name: &str, schema: ParameterSchema, required: bool) -> Self {
        self.properties.insert(name.to_string(), schema);
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    /// Render as JSON Schema for the model service.
    pub fn to_json_schema(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        let kind = self.kind.as_str();
        if self.nullable {
            out.insert("type".into(), serde_json::json!([kind, "null"]));
        } else {
            out.insert("type".into(), serde_json::json!(kind));
        }
        if !self.description.is_empty() {
            out.insert("description".into(), serde_json::json!(self.description));
        }
        if self.kind == ParameterType::Object {
            let props: serde_json::Map<String, serde_json::Value> = self
                .properties
                .iter()
                .map(|(name, schema)| (name.clone(), schema.to_json_schema()))
                .collect();
            out.insert("properties".into(), serde_json::Value::Object(props));
            if !self.required.is_empty() {
                out.insert("required".into(), serde_json::json!(self.required));
            }
        }
        if let Some(items) = &self.items {
            out.insert("items".into(), items.to_json_schema());
        }
        serde_json::Value::Object(out)
    }
}

/// A function declaration as sent to the model service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

/// Progress information derived from a call's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    /// Human-readable progress title ("Investigating network request").
    pub title: String,
    /// Canonical action label shown next to the title.
    pub action: String,
}

/// The result a handler hands back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionOutcome {
    Result(String),
    /// Recoverable failure; the reason is fed back to the model.
    Error(String),
}

impl FunctionOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Result(text) | Self::Error(text) => text,
        }
    }

    /// The text the model sees for this outcome.
    pub fn to_model_text(&self) -> String {
        match self {
            Self::Result(text) => text.clone(),
            Self::Error(reason) => format!("Error: {reason}"),
        }
    }
}

/// Canonical description of a call: `name(<args with sorted keys>)`.
pub fn canonical_call(name: &str, args: &serde_json::Value) -> String {
    let mut rendered = String::new();
    write_canonical(args, &mut rendered);
    format!("{name}({rendered})")
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// A host-invokable function the model may call.
#[async_trait]
pub trait DeclaredFunction: Send + Sync {
    /// Unique name within a registry (e.g. "getEventByKey").
    fn name(&self) -> &str;

    /// Description sent to the model.
    fn description(&self) -> &str;

    /// Parameter schema sent to the model.
    fn parameters(&self) -> ParameterSchema;

    /// Progress title and action label. Must be pure and synchronous.
    fn display_info(&self, args: &serde_json::Value) -> DisplayInfo {
        DisplayInfo {
            title: format!("Calling {}", self.name()),
            action: canonical_call(self.name(), args),
        }
    }

    /// Run the function. `Ok(FunctionOutcome::Error)` is recoverable;
    /// `Err` ends the turn.
    async fn handle(
        &self,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<FunctionOutcome, FunctionError>;

    fn to_declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// The set of functions declared for the current turn.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: Vec<Arc<dyn DeclaredFunction>>,
    by_name: HashMap<String, usize>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a function. Fails if the name is already declared.
    pub fn declare(&mut self, function: Arc<dyn DeclaredFunction>) -> Result<(), FunctionError> {
        let name = function.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(FunctionError::Duplicate(name));
        }
        debug!(function = %name, "Declared function");
        self.by_name.insert(name, self.functions.len());
        self.functions.push(function);
        Ok(())
    }

    /// Remove every declared function.
    pub fn clear(&mut self) {
        if !self.functions.is_empty() {
            debug!(count = self.functions.len(), "Clearing declared functions");
        }
        self.functions.clear();
        self.by_name.clear();
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeclaredFunction>> {
        self.by_name.get(name).map(|&i| self.functions[i].clone())
    }

    /// Declarations in declaration order.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.functions.iter().map(|f| f.to_declaration()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Look up and run a function by name.
    pub async fn invoke(
        &self,
        name: &str,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<FunctionOutcome, FunctionError> {
        let function = self
            .get(name)
            .ok_or_else(|| FunctionError::NotFound(name.to_string()))?;
        function.handle(args, cancel).await
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
