use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid image name: {0}")]
    InvalidImageName(String),

    #[error("invalid digest: got: {actual}, expected: {expected}")]
    InvalidDigest { expected: String, actual: String },

    #[error("invalid digest, only accept sha256")]
    InvalidRequestDigest,

    #[error("os type is empty")]
    InvalidOs,

    #[error("os distrib is empty")]
    InvalidDistrib,

    #[error("os arch is empty")]
    InvalidArch,

    #[error("format is empty")]
    InvalidFormat,

    #[error("image already exists")]
    Conflict,

    #[error("{0} not found")]
    NotFound(String),

    #[error("please login")]
    Unauthenticated,

    #[error("permission denied")]
    Forbidden,

    #[error("unexpected http status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),
}

impl HubError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn digest_mismatch(expected: &str, actual: &str) -> Self {
        Self::InvalidDigest {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        HubError::Network(err.to_string())
    }
}

/// Looks for a typed `HubError` anywhere in an `anyhow` chain.
pub fn as_hub_error(err: &anyhow::Error) -> Option<&HubError> {
    err.chain().find_map(|cause| cause.downcast_ref::<HubError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_mismatch_message_names_both_sides() {
        let err = HubError::digest_mismatch("aaaa", "bbbb");
        let msg = err.to_string();
        assert!(msg.contains("aaaa"));
        assert!(msg.contains("bbbb"));
        assert!(msg.contains("invalid digest"));
    }

    #[test]
    fn hub_error_is_found_through_anyhow_chain() {
        let err = anyhow::Error::new(HubError::Conflict).context("while pushing");
        assert!(matches!(as_hub_error(&err), Some(HubError::Conflict)));

        let plain = anyhow::anyhow!("something else");
        assert!(as_hub_error(&plain).is_none());
    }
}
