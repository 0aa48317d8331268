use thiserror::Error;

/// Errors raised while reading or writing relation data.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// A peer published a payload that is not a JSON array of objects.
    #[error("malformed record payload: {0}")]
    MalformedRecord(String),

    /// A decoded record lacks a required key.
    #[error("record is missing required field '{0}'")]
    MissingField(&'static str),

    /// A decoded record carries a key with an unusable value.
    #[error("invalid value for field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("failed to encode records: {0}")]
    Encode(#[from] serde_json::Error),

    /// Only the local app bag and the local unit bag may be written.
    #[error("cannot write data bag owned by '{0}'")]
    ForeignBag(String),

    #[error("unknown relation {0}")]
    UnknownRelation(u64),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, EndpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EndpointError::MissingField("service-name");
        assert_eq!(err.to_string(), "record is missing required field 'service-name'");

        let err = EndpointError::InvalidField {
            field: "frontend-port",
            reason: "0 is out of range".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for field 'frontend-port': 0 is out of range"
        );
    }
}
