use std::fmt;

use serde_json::Value;

/// Outcome of one remote method invocation.
pub type MethodResult = std::result::Result<Value, MethodError>;

/// Failures a method handler can report back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodError {
    /// A required positional parameter was not supplied.
    MissingParameter { index: usize, name: &'static str },
    /// A positional parameter was supplied with the wrong JSON type.
    InvalidParameter {
        index: usize,
        name: &'static str,
        expected: &'static str,
    },
    /// The handler ran but could not produce a reply.
    Failed(String),
}

impl MethodError {
    /// Return true when the failure is caused by the caller's parameters.
    pub fn is_params_error(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter { .. } | Self::InvalidParameter { .. }
        )
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingParameter { index, name } => {
                write!(f, "missing parameter {name} at position {index}")
            }
            Self::InvalidParameter {
                index,
                name,
                expected,
            } => write!(
                f,
                "parameter {name} at position {index} must be a {expected}"
            ),
            Self::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for MethodError {}

/// A remote-callable method.
///
/// Handlers receive the ordered positional parameters of a host request and
/// return exactly one reply value. Any `Fn(&[Value]) -> MethodResult` closure
/// is a handler.
pub trait MethodHandler: Send + Sync {
    fn invoke(&self, params: &[Value]) -> MethodResult;
}

impl<F> MethodHandler for F
where
    F: Fn(&[Value]) -> MethodResult + Send + Sync,
{
    fn invoke(&self, params: &[Value]) -> MethodResult {
        self(params)
    }
}

/// Borrow the string parameter at `index`.
pub fn required_str<'a>(
    params: &'a [Value],
    index: usize,
    name: &'static str,
) -> std::result::Result<&'a str, MethodError> {
    match params.get(index) {
        None | Some(Value::Null) => Err(MethodError::MissingParameter { index, name }),
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(MethodError::InvalidParameter {
            index,
            name,
            expected: "string",
        }),
    }
}
