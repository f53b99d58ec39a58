//! Runtime argument schemas for configured tools.
//!
//! A tool row declares its call-time arguments as a JSON array:
//!
//! ```json
//! [{"name": "city", "type": "string", "required": true, "description": "City name"},
//!  {"name": "days", "type": "integer", "default": 3}]
//! ```
//!
//! The array is checked once at load time, turned into a JSON-Schema object for
//! the execution engine, and used again at call time to validate arguments and
//! fill in defaults.

use serde_json::{Map, Value, json};
use std::fmt;

/// A problem in a tool row, located by a JSON-ish path such as
/// `runtime_args_schema[1].type` or `static_config.url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub path: String,
    pub reason: String,
}

impl ConfigIssue {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ArgType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    pub name: String,
    pub arg_type: ArgType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: String,
}

impl ArgSpec {
    pub fn required(name: &str, arg_type: ArgType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            arg_type,
            required: true,
            default: None,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, arg_type: ArgType, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, arg_type, description)
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Ordered set of arguments a bound tool accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgsSchema {
    args: Vec<ArgSpec>,
}

const SCHEMA_PATH: &str = "runtime_args_schema";

impl ArgsSchema {
    pub fn new(args: Vec<ArgSpec>) -> Self {
        Self { args }
    }

    pub fn args(&self) -> &[ArgSpec] {
        &self.args
    }

    /// Parse a row's `runtime_args_schema`. `null` counts as empty.
    pub fn parse(raw: &Value) -> Result<Self, ConfigIssue> {
        let entries = match raw {
            Value::Null => return Ok(Self::default()),
            Value::Array(entries) => entries,
            Value::String(_) => {
                return Err(ConfigIssue::new(SCHEMA_PATH, "is not valid JSON"));
            }
            _ => return Err(ConfigIssue::new(SCHEMA_PATH, "must be a JSON array")),
        };

        let mut args: Vec<ArgSpec> = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let at = |field: &str| format!("{}[{}]{}", SCHEMA_PATH, i, field);
            let obj = entry
                .as_object()
                .ok_or_else(|| ConfigIssue::new(at(""), "must be an object"))?;

            let name = match obj.get("name") {
                Some(Value::String(n)) if !n.trim().is_empty() => n.trim().to_string(),
                _ => return Err(ConfigIssue::new(at(".name"), "must be a non-empty string")),
            };
            if args.iter().any(|a| a.name == name) {
                return Err(ConfigIssue::new(
                    at(".name"),
                    format!("duplicate argument '{}'", name),
                ));
            }

            let arg_type = match obj.get("type") {
                Some(Value::String(t)) => ArgType::parse(t).ok_or_else(|| {
                    ConfigIssue::new(at(".type"), format!("unsupported type '{}'", t))
                })?,
                _ => return Err(ConfigIssue::new(at(".type"), "is required")),
            };

            let required = match obj.get("required") {
                None | Some(Value::Null) => false,
                Some(Value::Bool(b)) => *b,
                Some(_) => return Err(ConfigIssue::new(at(".required"), "must be a boolean")),
            };

            let default = match obj.get("default") {
                None | Some(Value::Null) => None,
                Some(value) if arg_type.accepts(value) => Some(value.clone()),
                Some(_) => {
                    return Err(ConfigIssue::new(
                        at(".default"),
                        format!("does not match type '{}'", arg_type.as_str()),
                    ));
                }
            };

            let description = match obj.get("description") {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(d)) => d.clone(),
                Some(_) => return Err(ConfigIssue::new(at(".description"), "must be a string")),
            };

            args.push(ArgSpec {
                name,
                arg_type,
                required,
                default,
                description,
            });
        }
        Ok(Self { args })
    }

    /// Prepend `base` (arguments the tool type always takes). A row argument
    /// that reuses a base name is rejected.
    pub fn with_base(self, base: Vec<ArgSpec>) -> Result<Self, ConfigIssue> {
        for (i, arg) in self.args.iter().enumerate() {
            if base.iter().any(|b| b.name == arg.name) {
                return Err(ConfigIssue::new(
                    format!("{}[{}].name", SCHEMA_PATH, i),
                    format!("'{}' is reserved by this tool type", arg.name),
                ));
            }
        }
        let mut args = base;
        args.extend(self.args);
        Ok(Self { args })
    }

    /// JSON-Schema `object` describing the arguments, for structured calls.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for arg in &self.args {
            let mut prop = Map::new();
            prop.insert("type".into(), json!(arg.arg_type.as_str()));
            if !arg.description.is_empty() {
                prop.insert("description".into(), json!(arg.description));
            }
            if let Some(default) = &arg.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(arg.name.clone(), Value::Object(prop));
            if arg.required {
                required.push(json!(arg.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Check call-time arguments and apply defaults. `null` is treated as `{}`.
    pub fn validate(&self, args: &Value) -> Result<Map<String, Value>, String> {
        let provided = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => return Err("arguments must be a JSON object".to_string()),
        };

        if let Some(unknown) = provided
            .keys()
            .find(|k| !self.args.iter().any(|a| &a.name == *k))
        {
            return Err(format!("unknown argument '{}'", unknown));
        }

        let mut resolved = Map::new();
        for arg in &self.args {
            match provided.get(&arg.name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &arg.default {
                        resolved.insert(arg.name.clone(), default.clone());
                    } else if arg.required {
                        return Err(format!("missing required argument '{}'", arg.name));
                    }
                }
                Some(value) if arg.arg_type.accepts(value) => {
                    resolved.insert(arg.name.clone(), value.clone());
                }
                Some(_) => {
                    return Err(format!(
                        "argument '{}' must be of type {}",
                        arg.name,
                        arg.arg_type.as_str()
                    ));
                }
            }
        }
        Ok(resolved)
    }
}

/// Accessors for a row's `static_config` object that report failures with
/// `static_config.<field>` paths.
pub struct StaticConfig<'a> {
    fields: Option<&'a Map<String, Value>>,
}

impl<'a> StaticConfig<'a> {
    pub fn new(raw: &'a Value) -> Result<Self, ConfigIssue> {
        match raw {
            Value::Null => Ok(Self { fields: None }),
            Value::Object(map) => Ok(Self { fields: Some(map) }),
            Value::String(_) => Err(ConfigIssue::new("static_config", "is not valid JSON")),
            _ => Err(ConfigIssue::new("static_config", "must be a JSON object")),
        }
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        self.fields
            .and_then(|f| f.get(field))
            .filter(|v| !v.is_null())
    }

    fn issue(field: &str, reason: &str) -> ConfigIssue {
        ConfigIssue::new(format!("static_config.{}", field), reason)
    }

    pub fn optional_str(&self, field: &str) -> Result<Option<&'a str>, ConfigIssue> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(Self::issue(field, "must be a string")),
        }
    }

    pub fn required_str(&self, field: &str) -> Result<&'a str, ConfigIssue> {
        match self.optional_str(field)? {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => Err(Self::issue(field, "is required")),
        }
    }

    pub fn optional_u64(&self, field: &str) -> Result<Option<u64>, ConfigIssue> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| Self::issue(field, "must be a non-negative integer")),
        }
    }

    pub fn optional_string_map(&self, field: &str) -> Result<Vec<(String, String)>, ConfigIssue> {
        match self.get(field) {
            None => Ok(Vec::new()),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k.clone(), s.clone())),
                    _ => Err(ConfigIssue::new(
                        format!("static_config.{}.{}", field, k),
                        "must be a string",
                    )),
                })
                .collect(),
            Some(_) => Err(Self::issue(field, "must be an object of strings")),
        }
    }
}
