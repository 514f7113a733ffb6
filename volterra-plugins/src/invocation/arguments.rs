//! Compilation of declared plugin arguments into CLI flags
//!
//! Each declared argument resolves to a raw value (locked preset, then the
//! runtime value, then the declared default), is checked against its type, and
//! is emitted as `--{key} {value}`. Invalid values are dropped rather than
//! failing the build; callers can inspect [`CompiledArguments::dropped`] or
//! use [`ArgumentCompiler::strict`] to reject them instead.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised by a strict argument compiler
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArgumentBuildError {
    /// A provided value did not satisfy its declared type
    #[error("Invalid value for argument '{key}': {reason}")]
    InvalidValue {
        /// Argument key
        key: String,
        /// Why the value was rejected
        reason: String,
    },
}

/// Declared type of a plugin argument
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgumentType {
    /// One of a fixed set of choices
    Select,
    /// A finite number
    Number,
    /// true/false/1/0
    Boolean,
    /// A timestep or an already-resolved frame path
    #[serde(alias = "frame")]
    TrajectoryFrame,
    /// Free text; unknown type names fall back to this
    #[default]
    #[serde(other)]
    String,
}

/// A choice in a select option list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentOption {
    pub key: String,
    #[serde(default)]
    pub label: String,
}

/// The choices of a select argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectOptions {
    /// `[{key, label}]` option records
    Keyed(Vec<ArgumentOption>),
    /// A plain sequence of values
    List(Vec<Value>),
    /// A map whose keys are the choices
    Map(serde_json::Map<String, Value>),
}

impl SelectOptions {
    /// The choices in their string form
    pub fn choices(&self) -> Vec<String> {
        match self {
            SelectOptions::Keyed(options) => options.iter().map(|o| o.key.clone()).collect(),
            SelectOptions::List(values) => values.iter().map(stringify).collect(),
            SelectOptions::Map(map) => map.keys().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            SelectOptions::Keyed(options) => options.is_empty(),
            SelectOptions::List(values) => values.is_empty(),
            SelectOptions::Map(map) => map.is_empty(),
        }
    }
}

/// How one argument is declared on the Arguments node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDeclaration {
    #[serde(rename = "type", default)]
    pub kind: ArgumentType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    /// Used when no runtime value is provided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Locked preset that wins over runtime values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Select choices
    #[serde(
        default,
        alias = "options",
        skip_serializing_if = "Option::is_none"
    )]
    pub values: Option<SelectOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

impl ArgumentDeclaration {
    /// Declaration of the given type with no default
    pub fn new(kind: ArgumentType) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_values(mut self, values: SelectOptions) -> Self {
        self.values = Some(values);
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

/// An argument left out of the compiled argv
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedArgument {
    pub key: String,
    pub reason: String,
}

/// Result of compiling arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledArguments {
    /// Flag/value tokens in declaration order
    pub argv: Vec<String>,
    /// Resolved value per emitted key, as emitted
    pub resolved: IndexMap<String, String>,
    /// Keys whose value failed validation
    pub dropped: Vec<DroppedArgument>,
}

impl CompiledArguments {
    /// True when at least one provided value was dropped as invalid
    pub fn is_partial(&self) -> bool {
        !self.dropped.is_empty()
    }
}

/// Turns argument declarations plus runtime values into CLI flags
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgumentCompiler {
    strict: bool,
}

impl ArgumentCompiler {
    /// Compiler that drops invalid values
    pub fn new() -> Self {
        Self { strict: false }
    }

    /// Compiler that fails on the first invalid value
    pub fn strict() -> Self {
        Self { strict: true }
    }

    /// Compile declarations and runtime values into an argv
    ///
    /// Iterates declarations in order, so identical inputs always produce
    /// identical argv sequences.
    pub fn compile(
        &self,
        declarations: &IndexMap<String, ArgumentDeclaration>,
        values: &HashMap<String, Value>,
    ) -> Result<CompiledArguments, ArgumentBuildError> {
        let mut compiled = CompiledArguments::default();

        for (key, declaration) in declarations {
            let Some(raw) = resolve_raw_value(key, declaration, values) else {
                continue;
            };

            match normalize(declaration, raw) {
                Ok(normalized) => {
                    compiled.argv.push(format!("--{}", key));
                    compiled.argv.push(normalized.clone());
                    compiled.resolved.insert(key.clone(), normalized);
                }
                Err(reason) => {
                    if self.strict {
                        return Err(ArgumentBuildError::InvalidValue {
                            key: key.clone(),
                            reason,
                        });
                    }
                    tracing::warn!("Dropping argument '{}': {}", key, reason);
                    compiled.dropped.push(DroppedArgument {
                        key: key.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(compiled)
    }
}

fn resolve_raw_value<'a>(
    key: &str,
    declaration: &'a ArgumentDeclaration,
    values: &'a HashMap<String, Value>,
) -> Option<&'a Value> {
    [
        declaration.value.as_ref(),
        values.get(key),
        declaration.default.as_ref(),
    ]
    .into_iter()
    .flatten()
    .find(|value| !value.is_null())
}

/// Validate a raw value against its declaration and return the emitted form
fn normalize(declaration: &ArgumentDeclaration, raw: &Value) -> Result<String, String> {
    match declaration.kind {
        ArgumentType::Select => {
            let Some(options) = declaration.values.as_ref().filter(|o| !o.is_empty()) else {
                return Err("select argument has no options".to_string());
            };
            let candidate = stringify(raw);
            if options.choices().iter().any(|choice| choice == &candidate) {
                Ok(candidate)
            } else {
                Err(format!("'{}' is not one of the allowed options", candidate))
            }
        }
        ArgumentType::Number => {
            let number = parse_number(raw)
                .ok_or_else(|| format!("'{}' is not a finite number", stringify(raw)))?;
            if let Some(min) = declaration.min {
                if number < min {
                    return Err(format!("{} is below the minimum {}", number, min));
                }
            }
            if let Some(max) = declaration.max {
                if number > max {
                    return Err(format!("{} is above the maximum {}", number, max));
                }
            }
            Ok(match raw {
                Value::Number(n) => n.to_string(),
                _ => stringify(raw).trim().to_string(),
            })
        }
        ArgumentType::Boolean => parse_bool(raw)
            .map(|b| b.to_string())
            .ok_or_else(|| format!("'{}' is not a boolean", stringify(raw))),
        ArgumentType::TrajectoryFrame => {
            let frame = stringify(raw).trim().to_string();
            if frame.is_empty() {
                Err("frame reference is empty".to_string())
            } else {
                Ok(frame)
            }
        }
        ArgumentType::String => Ok(stringify(raw)),
    }
}

fn parse_number(raw: &Value) -> Option<f64> {
    let number = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

fn parse_bool(raw: &Value) -> Option<bool> {
    match raw {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => Some(true),
            Some(v) if v == 0.0 => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// String form of a JSON value as it appears on a command line
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declarations(items: Vec<(&str, ArgumentDeclaration)>) -> IndexMap<String, ArgumentDeclaration> {
        items
            .into_iter()
            .map(|(k, d)| (k.to_string(), d))
            .collect()
    }

    fn values(items: Vec<(&str, Value)>) -> HashMap<String, Value> {
        items.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn mode_declaration() -> IndexMap<String, ArgumentDeclaration> {
        declarations(vec![(
            "mode",
            ArgumentDeclaration::new(ArgumentType::Select)
                .with_values(SelectOptions::List(vec![json!("fast"), json!("slow")])),
        )])
    }

    #[test]
    fn test_select_member_is_emitted() {
        let compiled = ArgumentCompiler::new()
            .compile(&mode_declaration(), &values(vec![("mode", json!("fast"))]))
            .unwrap();
        assert_eq!(compiled.argv, vec!["--mode", "fast"]);
        assert!(!compiled.is_partial());
    }

    #[test]
    fn test_select_non_member_is_dropped() {
        let compiled = ArgumentCompiler::new()
            .compile(&mode_declaration(), &values(vec![("mode", json!("bogus"))]))
            .unwrap();
        assert!(compiled.argv.is_empty());
        assert!(compiled.is_partial());
        assert_eq!(compiled.dropped[0].key, "mode");
    }

    #[test]
    fn test_select_with_empty_options_is_invalid() {
        let decls = declarations(vec![(
            "mode",
            ArgumentDeclaration::new(ArgumentType::Select)
                .with_values(SelectOptions::List(vec![])),
        )]);
        let compiled = ArgumentCompiler::new()
            .compile(&decls, &values(vec![("mode", json!("fast"))]))
            .unwrap();
        assert!(compiled.argv.is_empty());
    }

    #[test]
    fn test_select_keyed_and_map_options() {
        let keyed: ArgumentDeclaration = serde_json::from_value(json!({
            "type": "select",
            "options": [{"key": "fcc", "label": "FCC"}, {"key": "bcc", "label": "BCC"}]
        }))
        .unwrap();
        let map: ArgumentDeclaration = serde_json::from_value(json!({
            "type": "select",
            "values": {"1": "one", "2": "two"}
        }))
        .unwrap();
        let decls = declarations(vec![("lattice", keyed), ("level", map)]);

        let compiled = ArgumentCompiler::new()
            .compile(
                &decls,
                &values(vec![("lattice", json!("bcc")), ("level", json!(2))]),
            )
            .unwrap();
        assert_eq!(compiled.argv, vec!["--lattice", "bcc", "--level", "2"]);
    }

    #[test]
    fn test_missing_value_and_default_skips_key() {
        let decls = declarations(vec![("cutoff", ArgumentDeclaration::new(ArgumentType::Number))]);
        let compiled = ArgumentCompiler::new().compile(&decls, &HashMap::new()).unwrap();
        assert!(compiled.argv.is_empty());
        assert!(compiled.dropped.is_empty());
    }

    #[test]
    fn test_default_used_when_value_absent() {
        let decls = declarations(vec![(
            "cutoff",
            ArgumentDeclaration::new(ArgumentType::Number).with_default(3.5),
        )]);
        let compiled = ArgumentCompiler::new().compile(&decls, &HashMap::new()).unwrap();
        assert_eq!(compiled.argv, vec!["--cutoff", "3.5"]);
    }

    #[test]
    fn test_preset_value_wins_over_runtime_value() {
        let mut declaration = ArgumentDeclaration::new(ArgumentType::String).with_default("a");
        declaration.value = Some(json!("locked"));
        let decls = declarations(vec![("name", declaration)]);
        let compiled = ArgumentCompiler::new()
            .compile(&decls, &values(vec![("name", json!("user"))]))
            .unwrap();
        assert_eq!(compiled.argv, vec!["--name", "locked"]);
    }

    #[test]
    fn test_number_validation() {
        let decls = declarations(vec![
            ("a", ArgumentDeclaration::new(ArgumentType::Number)),
            ("b", ArgumentDeclaration::new(ArgumentType::Number)),
            ("c", ArgumentDeclaration::new(ArgumentType::Number)),
            ("d", ArgumentDeclaration::new(ArgumentType::Number)),
        ]);
        let compiled = ArgumentCompiler::new()
            .compile(
                &decls,
                &values(vec![
                    ("a", json!(" 2.5 ")),
                    ("b", json!("abc")),
                    ("c", json!("inf")),
                    ("d", json!(7)),
                ]),
            )
            .unwrap();
        assert_eq!(compiled.argv, vec!["--a", "2.5", "--d", "7"]);
        let dropped: Vec<_> = compiled.dropped.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(dropped, vec!["b", "c"]);
    }

    #[test]
    fn test_number_range_is_enforced() {
        let decls = declarations(vec![(
            "threads",
            ArgumentDeclaration::new(ArgumentType::Number).with_range(Some(1.0), Some(8.0)),
        )]);
        let compiler = ArgumentCompiler::new();
        assert!(compiler
            .compile(&decls, &values(vec![("threads", json!(16))]))
            .unwrap()
            .argv
            .is_empty());
        assert_eq!(
            compiler
                .compile(&decls, &values(vec![("threads", json!(4))]))
                .unwrap()
                .argv,
            vec!["--threads", "4"]
        );
    }

    #[test]
    fn test_boolean_normalization() {
        let decls = declarations(vec![
            ("a", ArgumentDeclaration::new(ArgumentType::Boolean)),
            ("b", ArgumentDeclaration::new(ArgumentType::Boolean)),
            ("c", ArgumentDeclaration::new(ArgumentType::Boolean)),
            ("d", ArgumentDeclaration::new(ArgumentType::Boolean)),
            ("e", ArgumentDeclaration::new(ArgumentType::Boolean)),
        ]);
        let compiled = ArgumentCompiler::new()
            .compile(
                &decls,
                &values(vec![
                    ("a", json!("TRUE")),
                    ("b", json!("0")),
                    ("c", json!(true)),
                    ("d", json!(1)),
                    ("e", json!("yes")),
                ]),
            )
            .unwrap();
        assert_eq!(
            compiled.argv,
            vec!["--a", "true", "--b", "false", "--c", "true", "--d", "true"]
        );
        assert_eq!(compiled.dropped.len(), 1);
    }

    #[test]
    fn test_trajectory_frame_requires_non_empty() {
        let decls = declarations(vec![
            ("frame", ArgumentDeclaration::new(ArgumentType::TrajectoryFrame)),
            ("other", ArgumentDeclaration::new(ArgumentType::TrajectoryFrame)),
        ]);
        let compiled = ArgumentCompiler::new()
            .compile(
                &decls,
                &values(vec![("frame", json!(" 1200 ")), ("other", json!("   "))]),
            )
            .unwrap();
        assert_eq!(compiled.argv, vec!["--frame", "1200"]);
        assert_eq!(compiled.dropped[0].key, "other");
    }

    #[test]
    fn test_unknown_type_is_string() {
        let declaration: ArgumentDeclaration =
            serde_json::from_value(json!({"type": "color"})).unwrap();
        assert_eq!(declaration.kind, ArgumentType::String);
        let frame: ArgumentDeclaration = serde_json::from_value(json!({"type": "frame"})).unwrap();
        assert_eq!(frame.kind, ArgumentType::TrajectoryFrame);
    }

    #[test]
    fn test_strict_compiler_rejects_invalid_value() {
        let err = ArgumentCompiler::strict()
            .compile(&mode_declaration(), &values(vec![("mode", json!("bogus"))]))
            .unwrap_err();
        assert!(matches!(err, ArgumentBuildError::InvalidValue { ref key, .. } if key == "mode"));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let decls = declarations(vec![
            ("z", ArgumentDeclaration::new(ArgumentType::String)),
            ("a", ArgumentDeclaration::new(ArgumentType::Number)),
            ("m", ArgumentDeclaration::new(ArgumentType::Boolean)),
        ]);
        let vals = values(vec![("a", json!(1)), ("m", json!("1")), ("z", json!("last"))]);
        let compiler = ArgumentCompiler::new();
        let first = compiler.compile(&decls, &vals).unwrap();
        let second = compiler.compile(&decls, &vals).unwrap();
        assert_eq!(first.argv, second.argv);
        assert_eq!(first.argv, vec!["--z", "last", "--a", "1", "--m", "true"]);
    }
}
