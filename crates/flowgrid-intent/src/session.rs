//! Credentials attached to every LCM call.

use std::fmt;

use flowgrid_core::config::AuthConfig;

use crate::error::{LcmError, LcmResult};

/// The identity intents are issued under.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user: String,
    pub token: String,
}

impl Session {
    pub fn new(user: &str, token: &str) -> Self {
        Self {
            user: user.to_string(),
            token: token.to_string(),
        }
    }

    /// Use `explicit` when given; otherwise build the session from `[auth]`.
    /// A `token_file` holding `user:token` wins over the inline token.
    pub fn resolve(explicit: Option<Session>, auth: &AuthConfig) -> LcmResult<Self> {
        if let Some(session) = explicit {
            return Ok(session);
        }
        match &auth.token_file {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    LcmError::Credentials(format!("{}: {e}", path.display()))
                })?;
                Self::parse(content.trim()).ok_or_else(|| {
                    LcmError::Credentials(format!("{}: expected user:token", path.display()))
                })
            }
            None => Ok(Self::new(&auth.user, &auth.token)),
        }
    }

    /// Parse `user:token`.
    pub fn parse(s: &str) -> Option<Self> {
        let (user, token) = s.split_once(':')?;
        if user.is_empty() {
            return None;
        }
        Some(Self::new(user, token))
    }

    /// Value of the `x-flowgrid-session` header.
    pub fn header_value(&self) -> String {
        format!("{}:{}", self.user, self.token)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_session_wins() {
        let auth = AuthConfig::default();
        let session = Session::resolve(Some(Session::new("alice", "t0k")), &auth).unwrap();
        assert_eq!(session.user, "alice");
    }

    #[test]
    fn inline_credentials_from_config() {
        let auth = AuthConfig {
            user: "svc".to_string(),
            token: "secret".to_string(),
            token_file: None,
        };
        let session = Session::resolve(None, &auth).unwrap();
        assert_eq!(session, Session::new("svc", "secret"));
        assert_eq!(session.header_value(), "svc:secret");
    }

    #[test]
    fn token_file_overrides_inline_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "oneadmin:abc:def\n").unwrap();
        let auth = AuthConfig {
            user: "svc".to_string(),
            token: "inline".to_string(),
            token_file: Some(path),
        };
        let session = Session::resolve(None, &auth).unwrap();
        assert_eq!(session, Session::new("oneadmin", "abc:def"));
    }

    #[test]
    fn unreadable_or_malformed_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = AuthConfig {
            token_file: Some(dir.path().join("absent")),
            ..AuthConfig::default()
        };
        assert!(matches!(
            Session::resolve(None, &missing),
            Err(LcmError::Credentials(_))
        ));

        let path = dir.path().join("bad");
        std::fs::write(&path, "no-colon").unwrap();
        let bad = AuthConfig {
            token_file: Some(path),
            ..AuthConfig::default()
        };
        assert!(Session::resolve(None, &bad).is_err());
    }

    #[test]
    fn debug_redacts_token() {
        let rendered = format!("{:?}", Session::new("u", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
