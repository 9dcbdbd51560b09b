//! Capability model: typed method signatures grouped into named interfaces.
//!
//! An interface is a fixed set of remotely callable methods. Interfaces
//! extend other interfaces; a module implementing `ICamera` also
//! implements `IAbortable`. Arguments travel as positional JSON values and
//! are checked against the signature on both ends of a call.

mod catalog;

pub use catalog::{InterfaceCatalog, ResolvedMethod};

use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Interface every module implements.
pub const IMODULE: &str = "IModule";

/// Reserved method answering with the declared interface names.
pub const LIST_INTERFACES: &str = "list_interfaces";

// =============================================================================
// Parameter types
// =============================================================================

/// Type of a method parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Str,
    List,
    Dict,
    Any,
    Optional(Box<ParamType>),
}

impl ParamType {
    /// Validate a JSON value against this type.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        let ok = match self {
            ParamType::Bool => value.is_boolean(),
            ParamType::Int => value.is_i64() || value.is_u64(),
            // Integers are acceptable where a float is expected.
            ParamType::Float => value.is_number(),
            ParamType::Str => value.is_string(),
            ParamType::List => value.is_array(),
            ParamType::Dict => value.is_object(),
            ParamType::Any => true,
            ParamType::Optional(inner) => {
                return if value.is_null() {
                    Ok(())
                } else {
                    inner.validate(value)
                };
            }
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "expected {}, got {}",
                self.display_name(),
                value_type_name(value)
            ))
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, ParamType::Optional(_))
    }

    pub fn display_name(&self) -> String {
        match self {
            ParamType::Bool => "boolean".to_string(),
            ParamType::Int => "integer".to_string(),
            ParamType::Float => "number".to_string(),
            ParamType::Str => "string".to_string(),
            ParamType::List => "array".to_string(),
            ParamType::Dict => "object".to_string(),
            ParamType::Any => "any".to_string(),
            ParamType::Optional(inner) => format!("{}?", inner.display_name()),
        }
    }

    pub fn optional(inner: ParamType) -> Self {
        ParamType::Optional(Box::new(inner))
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Method signatures
// =============================================================================

/// One named, typed parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
}

/// Signature of one remotely callable method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,

    #[serde(default)]
    pub params: Vec<Param>,

    #[serde(default = "any_type")]
    pub returns: ParamType,

    /// Expected duration; callers use it as their default deadline.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

fn any_type() -> ParamType {
    ParamType::Any
}

impl MethodSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: ParamType::Any,
            timeout: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, param_type: ParamType) -> Self {
        self.params.push(Param {
            name: name.into(),
            param_type,
        });
        self
    }

    pub fn returns(mut self, returns: ParamType) -> Self {
        self.returns = returns;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of leading parameters a caller must supply.
    pub fn required_params(&self) -> usize {
        self.params
            .iter()
            .rposition(|p| !p.param_type.is_optional())
            .map_or(0, |i| i + 1)
    }

    /// Check positional arguments against this signature.
    ///
    /// Trailing optional parameters may be omitted.
    pub fn check_args(&self, args: &[Value]) -> Result<()> {
        let required = self.required_params();
        if args.len() < required || args.len() > self.params.len() {
            let expected = if required == self.params.len() {
                required.to_string()
            } else {
                format!("{}..={}", required, self.params.len())
            };
            return Err(Error::invocation(format!(
                "{}() takes {} argument(s), got {}",
                self.name,
                expected,
                args.len()
            )));
        }
        for (param, value) in self.params.iter().zip(args) {
            param.param_type.validate(value).map_err(|msg| {
                Error::invocation(format!("{}(): argument '{}': {}", self.name, param.name, msg))
            })?;
        }
        Ok(())
    }
}

// =============================================================================
// Interface descriptors
// =============================================================================

/// A named capability: the interfaces it extends plus its own methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub name: String,

    #[serde(default)]
    pub extends: Vec<String>,

    #[serde(default)]
    pub methods: Vec<MethodSignature>,
}

impl InterfaceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extends: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends.push(parent.into());
        self
    }

    pub fn method(mut self, method: MethodSignature) -> Self {
        self.methods.push(method);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_type_validate() {
        assert!(ParamType::Float.validate(&json!(1)).is_ok());
        assert!(ParamType::Float.validate(&json!(1.5)).is_ok());
        assert!(ParamType::Int.validate(&json!(1.5)).is_err());
        assert!(ParamType::Str.validate(&json!(3)).is_err());
        assert!(ParamType::optional(ParamType::Int).validate(&Value::Null).is_ok());
        assert!(ParamType::optional(ParamType::Int).validate(&json!("x")).is_err());
        assert!(ParamType::Any.validate(&json!({"a": [1]})).is_ok());
    }

    #[test]
    fn test_validate_error_message() {
        let err = ParamType::Bool.validate(&json!(2.5)).unwrap_err();
        assert_eq!(err, "expected boolean, got float");
    }

    #[test]
    fn test_check_args_arity() {
        let sig = MethodSignature::new("move_radec")
            .param("ra", ParamType::Float)
            .param("dec", ParamType::Float);

        assert!(sig.check_args(&[json!(10.0), json!(-5.0)]).is_ok());
        let err = sig.check_args(&[json!(10.0)]).unwrap_err();
        assert!(err.to_string().contains("takes 2 argument(s), got 1"));
        assert!(sig
            .check_args(&[json!(1.0), json!(2.0), json!(3.0)])
            .is_err());
    }

    #[test]
    fn test_check_args_trailing_optional() {
        let sig = MethodSignature::new("expose")
            .param("exposure_time", ParamType::Float)
            .param("broadcast", ParamType::optional(ParamType::Bool));

        assert_eq!(sig.required_params(), 1);
        assert!(sig.check_args(&[json!(2.0)]).is_ok());
        assert!(sig.check_args(&[json!(2.0), json!(false)]).is_ok());
        let err = sig.check_args(&[json!("long")]).unwrap_err();
        assert!(err.to_string().contains("argument 'exposure_time'"));
    }

    #[test]
    fn test_signature_deserializes_with_defaults() {
        let sig: MethodSignature = serde_json::from_value(json!({
            "name": "park",
            "timeout": "5m"
        }))
        .unwrap();
        assert_eq!(sig.returns, ParamType::Any);
        assert_eq!(sig.timeout, Some(Duration::from_secs(300)));
        assert!(sig.params.is_empty());
    }
}
