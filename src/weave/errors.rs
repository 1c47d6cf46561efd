use crate::il;

/// Reasons a weave is abandoned
///
/// Every variant names the method being woven (as `Class::method`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("`{method}` has a malformed body: {source}")]
    Malformed {
        method: String,
        #[source]
        source: il::Error,
    },

    /// A member the compiler is expected to have synthesized is missing
    #[error("`{method}`: `{owner}` has no member `{member}`")]
    MissingMember {
        method: String,
        owner: String,
        member: String,
    },

    #[error("`{method}` has {arity} parameters and the array container fallback is disabled")]
    UnsupportedArity { method: String, arity: usize },

    #[error("`{method}` cannot be woven: {reason}")]
    UnsupportedShape { method: String, reason: String },

    #[error("`{method}` has already been woven")]
    AlreadyWoven { method: String },

    #[error("`{method}` has no body")]
    NoBody { method: String },
}

impl Error {
    pub(crate) fn shape(method: &str, reason: impl Into<String>) -> Error {
        Error::UnsupportedShape {
            method: method.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(method: &str) -> impl FnOnce(il::Error) -> Error + '_ {
        move |source| Error::Malformed {
            method: method.to_owned(),
            source,
        }
    }
}
