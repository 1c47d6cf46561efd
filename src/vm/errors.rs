use super::Value;

/// Ways an invocation can fail to produce a value
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Exception that escaped every handler
    #[error("unhandled exception: {0}")]
    Thrown(Value),

    /// The code did something the machine can't make sense of (bad operand types, missing body)
    #[error("fault in `{method}`: {message}")]
    Fault { method: String, message: String },

    #[error("no aspect is registered under `{0}`")]
    UnknownAspect(String),

    #[error("call depth exceeded {0} frames")]
    StackOverflow(usize),
}

impl VmError {
    pub(crate) fn fault(method: &str, message: impl Into<String>) -> VmError {
        VmError::Fault {
            method: method.to_owned(),
            message: message.into(),
        }
    }

    /// Exception that escaped, if that's what this is
    pub fn thrown(&self) -> Option<&Value> {
        match self {
            VmError::Thrown(value) => Some(value),
            _ => None,
        }
    }
}
