/// Error taxonomy for the client core.
///
/// Every failure is recoverable: the caller surfaces it once and the event
/// loop, channel, and staged state all remain usable afterwards. Nothing in
/// the core retries automatically.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The capture collaborator denied access; the user must grant it in
    /// OS settings.
    Permission,
    /// Missing staged image or empty identifier; the user corrects input.
    Validation,
    /// Network unreachable, timeout, or non-2xx response; manual retry.
    Transport,
    /// Malformed server payload (push frame or acknowledgment). Journaled
    /// under its own event type as a compatibility signal.
    Protocol,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Permission => "permission",
            ErrorKind::Validation => "validation",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientError {
    kind: ErrorKind,
    message: String,
}

impl ClientError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transport(&self) -> bool {
        self.kind == ErrorKind::Transport
    }

    pub fn is_validation(&self) -> bool {
        self.kind == ErrorKind::Validation
    }

    pub fn is_protocol(&self) -> bool {
        self.kind == ErrorKind::Protocol
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ClientError {}

#[cfg(test)]
mod tests {
    use super::{ClientError, ErrorKind};

    #[test]
    fn constructors_map_to_kinds() {
        assert_eq!(ClientError::permission("x").kind(), ErrorKind::Permission);
        assert_eq!(ClientError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(ClientError::transport("x").kind(), ErrorKind::Transport);
        assert_eq!(ClientError::protocol("x").kind(), ErrorKind::Protocol);
    }

    #[test]
    fn classification_accessors() {
        assert!(ClientError::transport("timed out").is_transport());
        assert!(!ClientError::transport("timed out").is_validation());
        assert!(ClientError::validation("empty").is_validation());
        assert!(ClientError::protocol("bad frame").is_protocol());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = ClientError::transport("connection refused");
        assert_eq!(err.to_string(), "transport: connection refused");
        assert_eq!(err.message(), "connection refused");
    }
}
