use thiserror::Error;

/// Failures of a relay operation on an authenticated connection.
///
/// None of these tear the connection down: the session converts them into an
/// `error` event addressed to the originating connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("You can only message friends")]
    NotFriends,

    #[error("You can only delete your own messages")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("Message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Too many events, slow down")]
    RateLimited,

    #[error("Internal server error")]
    Internal,
}

impl RelayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Text placed in the `error{message}` event.
    ///
    /// Store failures are not echoed verbatim to clients.
    pub fn client_message(&self) -> String {
        match self {
            Self::StoreUnavailable(_) => "Message store unavailable, try again".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_detail_hidden_from_client() {
        let err = RelayError::StoreUnavailable("disk I/O error at /var/db".into());
        assert!(!err.client_message().contains("/var/db"));
        assert_eq!(
            RelayError::NotFound("Message").client_message(),
            "Message not found"
        );
    }
}
