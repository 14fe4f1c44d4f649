//! Machine parameters.
//!
//! A [`Parameter`] couples a [`ParamKind`] with arity, default and null
//! rules. Values are plain JSON values throughout; resolution converts the
//! caller-provided value into the declared shape or fails with a
//! [`ParameterError`] naming the parameter.
//!
//! Two kinds are special. [`ParamKind::Frozen`] is a constant: it is never
//! presented for assignment and always resolves to its stored value.
//! Variable-i/o kinds do not resolve to a data value at all but to a
//! [`TargetType`], swapping (or dropping) one of the machine's i/o slots at
//! solve time.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8Path;
use serde_json::Value;

use crate::error::ParameterError;
use crate::handlers::FileHandler;
use crate::target::TargetType;

/// Free-form or closed-choice variable i/o.
#[derive(Clone)]
pub enum VarIo {
    /// Any destination; the value is parsed with the `name[:type[:dest]]`
    /// slot grammar. Defaults fill in a missing type or handler.
    Free {
        default_type: Option<String>,
        default_handler: Option<Arc<dyn FileHandler>>,
    },
    /// Closed set of destinations, keyed by option name.
    Selector(BTreeMap<String, TargetType>),
}

impl VarIo {
    /// Resolve a value to a slot; `Null` drops the i/o entirely.
    pub fn resolve(&self, name: &str, value: &Value) -> Result<Option<TargetType>, ParameterError> {
        match value {
            Value::Null => Ok(None),
            Value::String(text) => match self {
                VarIo::Free {
                    default_type,
                    default_handler,
                } => {
                    let (_, mut slot) =
                        TargetType::parse(text).map_err(|_| ParameterError::Invalid {
                            name: name.to_string(),
                            value: text.clone(),
                        })?;
                    if slot.ty().is_none() {
                        if let Some(ty) = default_type {
                            slot = slot.with_type(ty.clone());
                        } else if let Some(handler) = default_handler {
                            slot = slot.with_handler(handler.clone());
                        }
                    }
                    Ok(Some(slot))
                }
                VarIo::Selector(choices) => {
                    choices
                        .get(text)
                        .cloned()
                        .map(Some)
                        .ok_or_else(|| ParameterError::Choice {
                            name: name.to_string(),
                            value: text.clone(),
                        })
                }
            },
            other => Err(ParameterError::Invalid {
                name: name.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone)]
pub enum ParamKind {
    Str,
    Int,
    Float,
    Bool,
    /// Closed set of accepted values.
    Choice(Vec<Value>),
    /// Boolean flag.
    Flag,
    /// Maps an option name to a substituted value.
    Switch(BTreeMap<String, Value>),
    /// Filesystem path, normalized; optionally required to exist.
    Path { exists: bool },
    /// Constant value, never assigned by the caller.
    Frozen(Value),
    /// Late-bound i/o slot.
    VariableIo(VarIo),
}

impl ParamKind {
    fn convert(&self, name: &str, value: &Value) -> Result<Value, ParameterError> {
        let invalid = || ParameterError::Invalid {
            name: name.to_string(),
            value: value.to_string(),
        };
        match self {
            ParamKind::Str => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(invalid()),
            },
            ParamKind::Int => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .map(Value::from)
                    .ok_or_else(invalid),
                Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| invalid()),
                _ => Err(invalid()),
            },
            ParamKind::Float => match value {
                Value::Number(n) => n.as_f64().map(Value::from).ok_or_else(invalid),
                Value::String(s) => s.trim().parse::<f64>().map(Value::from).map_err(|_| invalid()),
                _ => Err(invalid()),
            },
            ParamKind::Bool | ParamKind::Flag => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) => match s.to_lowercase().as_str() {
                    "true" | "1" => Ok(Value::Bool(true)),
                    "false" | "0" => Ok(Value::Bool(false)),
                    _ => Err(invalid()),
                },
                Value::Number(n) => Ok(Value::Bool(n.as_f64() != Some(0.0))),
                _ => Err(invalid()),
            },
            ParamKind::Choice(values) => {
                if values.contains(value) {
                    Ok(value.clone())
                } else {
                    Err(ParameterError::Choice {
                        name: name.to_string(),
                        value: value.to_string(),
                    })
                }
            }
            ParamKind::Switch(options) => {
                let key = value.as_str().ok_or_else(invalid)?;
                options
                    .get(key)
                    .cloned()
                    .ok_or_else(|| ParameterError::Choice {
                        name: name.to_string(),
                        value: value.to_string(),
                    })
            }
            ParamKind::Path { exists } => {
                let text = value.as_str().ok_or_else(invalid)?;
                let path = Utf8Path::new(text);
                if *exists && !path.exists() {
                    return Err(ParameterError::PathMissing(text.to_string()));
                }
                Ok(Value::String(path.as_str().to_string()))
            }
            ParamKind::Frozen(frozen) => Ok(frozen.clone()),
            // Data-value view of a variable i/o: pass the raw value through;
            // the slot substitution happens at machine solve time.
            ParamKind::VariableIo(_) => Ok(value.clone()),
        }
    }
}

#[derive(Clone)]
pub struct Parameter {
    kind: ParamKind,
    name: String,
    nargs: Option<i64>,
    default: Option<Value>,
    allow_none: bool,
    help: Option<String>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            kind,
            name: name.into(),
            nargs: None,
            default: None,
            allow_none: false,
            help: None,
        }
    }

    /// Shorthand for a frozen (constant) parameter.
    pub fn frozen(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, ParamKind::Frozen(value))
    }

    /// A default makes the parameter optional; a `Null` default also makes
    /// null an accepted value.
    pub fn with_default(mut self, value: Value) -> Self {
        if value.is_null() {
            self.allow_none = true;
        }
        self.default = Some(value);
        self
    }

    pub fn allow_none(mut self, allow: bool) -> Self {
        self.allow_none = allow;
        self
    }

    /// Fixed arity, or `-1` for an any-length sequence.
    pub fn with_nargs(mut self, nargs: i64) -> Self {
        self.nargs = Some(nargs);
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ParamKind {
        &self.kind
    }

    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    pub fn required(&self) -> bool {
        self.default.is_none() && !matches!(self.kind, ParamKind::Frozen(_))
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.kind, ParamKind::Frozen(_))
    }

    pub fn is_variable_io(&self) -> bool {
        matches!(self.kind, ParamKind::VariableIo(_))
    }

    pub fn variable_io(&self) -> Option<&VarIo> {
        match &self.kind {
            ParamKind::VariableIo(vio) => Some(vio),
            _ => None,
        }
    }

    /// Resolve the provided value (or the default) to this parameter's shape.
    pub fn parse(&self, value: Option<&Value>) -> Result<Value, ParameterError> {
        if let ParamKind::Frozen(frozen) = &self.kind {
            return Ok(frozen.clone());
        }

        let value = match value {
            None => {
                return self
                    .default
                    .clone()
                    .ok_or_else(|| ParameterError::Missing(self.name.clone()));
            }
            Some(Value::Null) => {
                if self.allow_none {
                    return Ok(Value::Null);
                }
                return Err(ParameterError::Null(self.name.clone()));
            }
            Some(value) => value,
        };

        let Some(nargs) = self.nargs else {
            return self.kind.convert(&self.name, value);
        };

        // sequence parameters: wrap scalars where a single value is allowed
        let items: Vec<Value> = match value {
            Value::Array(items) => items.clone(),
            scalar if nargs == -1 || nargs == 1 => vec![scalar.clone()],
            _ => {
                return Err(ParameterError::Arity {
                    name: self.name.clone(),
                    expected: nargs,
                    got: 1,
                });
            }
        };
        if nargs > 0 && items.len() as i64 != nargs {
            return Err(ParameterError::Arity {
                name: self.name.clone(),
                expected: nargs,
                got: items.len(),
            });
        }

        let converted: Result<Vec<Value>, _> = items
            .iter()
            .map(|item| self.kind.convert(&self.name, item))
            .collect();
        Ok(Value::Array(converted?))
    }
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            ParamKind::Str => "STRING".to_string(),
            ParamKind::Int => "INT".to_string(),
            ParamKind::Float => "FLOAT".to_string(),
            ParamKind::Bool => "BOOL".to_string(),
            ParamKind::Choice(values) => format!("Choice({values:?})"),
            ParamKind::Flag => "Flag".to_string(),
            ParamKind::Switch(options) => {
                format!("Switch({:?})", options.keys().collect::<Vec<_>>())
            }
            ParamKind::Path { .. } => "Path".to_string(),
            ParamKind::Frozen(value) => format!("Frozen({value})"),
            ParamKind::VariableIo(_) => "Variable I/O".to_string(),
        };
        write!(f, "Parameter({}, name={})", kind, self.name)
    }
}

/// Resolve every declared parameter against the provided values.
pub fn solve_parameters(
    declared: &BTreeMap<String, Parameter>,
    provided: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, ParameterError> {
    let mut solved = BTreeMap::new();
    for (name, parameter) in declared {
        solved.insert(name.clone(), parameter.parse(provided.get(name))?);
    }
    Ok(solved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required_and_default() {
        let p = Parameter::new("x", ParamKind::Int);
        assert!(p.required());
        assert!(matches!(p.parse(None), Err(ParameterError::Missing(_))));

        let p = Parameter::new("x", ParamKind::Int).with_default(json!(3));
        assert!(!p.required());
        assert_eq!(p.parse(None).unwrap(), json!(3));
        assert_eq!(p.parse(Some(&json!(5))).unwrap(), json!(5));
    }

    #[test]
    fn test_null_handling() {
        let p = Parameter::new("x", ParamKind::Int);
        assert!(matches!(
            p.parse(Some(&Value::Null)),
            Err(ParameterError::Null(_))
        ));

        let p = Parameter::new("x", ParamKind::Int).with_default(Value::Null);
        assert_eq!(p.parse(Some(&Value::Null)).unwrap(), Value::Null);
        assert_eq!(p.parse(None).unwrap(), Value::Null);
    }

    #[test]
    fn test_conversions() {
        let p = Parameter::new("x", ParamKind::Int);
        assert_eq!(p.parse(Some(&json!("42"))).unwrap(), json!(42));
        assert!(p.parse(Some(&json!("nope"))).is_err());

        let p = Parameter::new("x", ParamKind::Str);
        assert_eq!(p.parse(Some(&json!(1))).unwrap(), json!("1"));

        let p = Parameter::new("x", ParamKind::Bool);
        assert_eq!(p.parse(Some(&json!("true"))).unwrap(), json!(true));
        assert_eq!(p.parse(Some(&json!("0"))).unwrap(), json!(false));

        let p = Parameter::new("x", ParamKind::Float);
        assert_eq!(p.parse(Some(&json!("1.5"))).unwrap(), json!(1.5));
    }

    #[test]
    fn test_choice() {
        let p = Parameter::new("x", ParamKind::Choice(vec![json!("a"), json!("b")]));
        assert_eq!(p.parse(Some(&json!("a"))).unwrap(), json!("a"));
        assert!(matches!(
            p.parse(Some(&json!("c"))),
            Err(ParameterError::Choice { .. })
        ));
    }

    #[test]
    fn test_switch() {
        let options = BTreeMap::from([
            ("fast".to_string(), json!({"iterations": 1})),
            ("slow".to_string(), json!({"iterations": 100})),
        ]);
        let p = Parameter::new("x", ParamKind::Switch(options));
        assert_eq!(
            p.parse(Some(&json!("fast"))).unwrap(),
            json!({"iterations": 1})
        );
        assert!(p.parse(Some(&json!("other"))).is_err());
    }

    #[test]
    fn test_nargs() {
        let p = Parameter::new("x", ParamKind::Int).with_nargs(2);
        assert_eq!(p.parse(Some(&json!(["1", 2]))).unwrap(), json!([1, 2]));
        assert!(matches!(
            p.parse(Some(&json!([1]))),
            Err(ParameterError::Arity { .. })
        ));
        assert!(p.parse(Some(&json!(1))).is_err());

        let p = Parameter::new("x", ParamKind::Int).with_nargs(-1);
        assert_eq!(p.parse(Some(&json!(7))).unwrap(), json!([7]));
        assert_eq!(p.parse(Some(&json!([1, 2, 3]))).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_frozen() {
        let p = Parameter::frozen("x", json!("locked"));
        assert!(!p.required());
        assert_eq!(p.parse(None).unwrap(), json!("locked"));
        // assignment is ignored
        assert_eq!(p.parse(Some(&json!("other"))).unwrap(), json!("locked"));
    }

    #[test]
    fn test_variable_io_free() {
        let vio = VarIo::Free {
            default_type: None,
            default_handler: None,
        };
        let slot = vio.resolve("dest", &json!("A::D")).unwrap().unwrap();
        assert_eq!(slot.dest(), Some("D"));
        assert!(vio.resolve("dest", &Value::Null).unwrap().is_none());
        assert!(vio.resolve("dest", &json!(1)).is_err());
    }

    #[test]
    fn test_variable_io_selector() {
        let choices = BTreeMap::from([
            ("raw".to_string(), TargetType::new("raw_data").unwrap()),
            ("clean".to_string(), TargetType::new("clean_data").unwrap()),
        ]);
        let vio = VarIo::Selector(choices);
        let slot = vio.resolve("source", &json!("raw")).unwrap().unwrap();
        assert_eq!(slot.dest(), Some("raw_data"));
        assert!(matches!(
            vio.resolve("source", &json!("other")),
            Err(ParameterError::Choice { .. })
        ));
    }

    #[test]
    fn test_solve_parameters() {
        let declared = BTreeMap::from([
            ("a".to_string(), Parameter::new("a", ParamKind::Int)),
            (
                "b".to_string(),
                Parameter::new("b", ParamKind::Str).with_default(json!("d")),
            ),
            ("c".to_string(), Parameter::frozen("c", json!(9))),
        ]);
        let provided = BTreeMap::from([("a".to_string(), json!(1))]);
        let solved = solve_parameters(&declared, &provided).unwrap();
        assert_eq!(solved["a"], json!(1));
        assert_eq!(solved["b"], json!("d"));
        assert_eq!(solved["c"], json!(9));

        assert!(solve_parameters(&declared, &BTreeMap::new()).is_err());
    }
}
