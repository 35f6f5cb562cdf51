//! Registry credentials.
//!
//! A container may carry a username/password pair or a registry bearer
//! token. Which kind applies is decided once, when the input is validated,
//! and carried as a [`RegistryCredential`] from then on.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use secpol_common::{PolicyError, PolicyResult};

/// Credential used to pull an image.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum RegistryCredential {
    /// Pull anonymously.
    #[default]
    Anonymous,
    /// HTTP basic authentication.
    Basic {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
    /// A registry token sent as `Authorization: Bearer`.
    Bearer {
        /// The token.
        token: String,
    },
}

impl RegistryCredential {
    /// Decide the credential kind from a container's optional auth fields.
    ///
    /// Empty strings count as absent.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidSpec`] if both a username/password pair
    /// and a token are set, or if only one half of the pair is set.
    pub fn from_parts(username: &str, password: &str, token: &str) -> PolicyResult<Self> {
        let has_user = !username.is_empty();
        let has_password = !password.is_empty();
        let has_token = !token.is_empty();

        if has_user != has_password {
            return Err(PolicyError::InvalidSpec {
                message: "auth.username and auth.password must be set together".to_string(),
            });
        }

        match (has_user, has_token) {
            (true, true) => Err(PolicyError::InvalidSpec {
                message: "auth sets both username/password and token; choose one".to_string(),
            }),
            (true, false) => Ok(Self::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }),
            (false, true) => Ok(Self::Bearer {
                token: token.to_string(),
            }),
            (false, false) => Ok(Self::Anonymous),
        }
    }

    /// Value for an `Authorization` header, if any.
    #[must_use]
    pub fn authorization(&self) -> Option<String> {
        match self {
            Self::Anonymous => None,
            Self::Basic { username, password } => Some(format!(
                "Basic {}",
                BASE64.encode(format!("{username}:{password}"))
            )),
            Self::Bearer { token } => Some(format!("Bearer {token}")),
        }
    }

    /// Short name of the credential kind, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Basic { .. } => "basic",
            Self::Bearer { .. } => "bearer",
        }
    }
}

// Secrets never reach logs.
impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credential() {
        let cred = RegistryCredential::from_parts("user", "pass123", "").unwrap();
        assert_eq!(cred.kind(), "basic");
        assert_eq!(
            cred.authorization().as_deref(),
            Some("Basic dXNlcjpwYXNzMTIz")
        );
    }

    #[test]
    fn bearer_credential() {
        let cred = RegistryCredential::from_parts("", "", "tok").unwrap();
        assert_eq!(cred, RegistryCredential::Bearer { token: "tok".into() });
        assert_eq!(cred.authorization().as_deref(), Some("Bearer tok"));
    }

    #[test]
    fn anonymous_when_nothing_is_set() {
        let cred = RegistryCredential::from_parts("", "", "").unwrap();
        assert_eq!(cred, RegistryCredential::Anonymous);
        assert!(cred.authorization().is_none());
    }

    #[test]
    fn basic_and_bearer_conflict() {
        let err = RegistryCredential::from_parts("user", "pass", "tok").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidSpec { .. }));
    }

    #[test]
    fn half_a_pair_is_rejected() {
        assert!(RegistryCredential::from_parts("user", "", "").is_err());
        assert!(RegistryCredential::from_parts("", "pass", "").is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let cred = RegistryCredential::from_parts("user", "hunter2", "").unwrap();
        let debug = format!("{cred:?}");
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
    }
}
