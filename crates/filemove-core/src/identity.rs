//! User identity.
//!
//! The core never authenticates anyone. A [`Username`] reaches a session
//! already authenticated by an [`IdentityStore`] and is carried from there:
//! into the session at construction and into every frame the session sends.

use std::fmt;
use std::str::FromStr;

/// Maximum username length in bytes
pub const MAX_USERNAME_LEN: usize = 64;

/// Identity errors
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Username breaks the naming rules
    #[error("invalid username {name:?}: {reason}")]
    InvalidUsername {
        /// Offending name
        name: String,
        /// Rule it breaks
        reason: &'static str,
    },

    /// A user with this name already exists
    #[error("user {0} already exists")]
    AlreadyExists(String),

    /// Unknown user or wrong password
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The store itself failed
    #[error("identity store error: {0}")]
    Backend(String),
}

/// A validated username
///
/// Non-empty, at most 64 bytes, and free of `|`, path separators,
/// whitespace and control characters. `.` and `..` are rejected. The name
/// doubles as the user's storage directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Username(String);

impl Username {
    /// Validate a username
    pub fn new(name: impl Into<String>) -> Result<Self, IdentityError> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("empty")
        } else if name.len() > MAX_USERNAME_LEN {
            Some("longer than 64 bytes")
        } else if name == "." || name == ".." {
            Some("reserved name")
        } else if name.contains(['|', '/', '\\']) {
            Some("contains '|' or a path separator")
        } else if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            Some("contains whitespace or control characters")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(IdentityError::InvalidUsername { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// The name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner string
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Username {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Credential storage
///
/// Password hashing belongs to the implementation; callers only ever pass
/// plaintext to [`verify`](Self::verify) and an already-derived hash to
/// [`create`](Self::create).
pub trait IdentityStore: Send + Sync {
    /// Persist a new user
    fn create(&self, username: &Username, password_hash: &str) -> Result<(), IdentityError>;

    /// Stored hash for a user, `None` if unknown
    fn password_hash(&self, username: &Username) -> Result<Option<String>, IdentityError>;

    /// Check a password against the stored hash
    fn verify(&self, username: &Username, password: &[u8]) -> Result<bool, IdentityError>;
}

/// Verify credentials and return the authenticated username
pub fn authenticate<S>(store: &S, username: &str, password: &[u8]) -> Result<Username, IdentityError>
where
    S: IdentityStore + ?Sized,
{
    let username = Username::new(username)?;
    if store.verify(&username, password)? {
        tracing::info!("User {} authenticated", username);
        Ok(username)
    } else {
        tracing::warn!("Authentication failed for {}", username);
        Err(IdentityError::AuthenticationFailed)
    }
}
