//! File-backed identity store.
//!
//! Users live in a JSON document mapping each username to an Argon2id PHC
//! string. Writes go to a sibling temporary file that is renamed over the
//! store, so a crash never leaves a half-written document behind.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use filemove_core::{IdentityError, IdentityStore, Username};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::Zeroizing;

/// Shortest accepted password
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Records {
    users: BTreeMap<String, String>,
}

/// Identity store persisted as a JSON file
pub struct FileIdentityStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileIdentityStore {
    /// Open (or lazily create) the store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hash `password` and create `username`
    pub fn register(&self, username: &Username, password: &[u8]) -> Result<(), IdentityError> {
        if password.len() < MIN_PASSWORD_LEN {
            return Err(IdentityError::Backend(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        let hash = hash_password(password)?;
        self.create(username, &hash)
    }

    fn load(&self) -> Result<Records, IdentityError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| IdentityError::Backend(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Records::default()),
            Err(e) => Err(backend(&self.path, e)),
        }
    }

    fn save(&self, records: &Records) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| backend(parent, e))?;
        }

        let contents = serde_json::to_string_pretty(records)
            .map_err(|e| IdentityError::Backend(e.to_string()))?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, contents).map_err(|e| backend(&temp, e))?;
        fs::rename(&temp, &self.path).map_err(|e| backend(&self.path, e))
    }
}

fn backend(path: &Path, err: io::Error) -> IdentityError {
    IdentityError::Backend(format!("{}: {err}", path.display()))
}

/// Derive an Argon2id PHC string for `password`
pub fn hash_password(password: &[u8]) -> Result<String, IdentityError> {
    let salt = SaltString::generate(&mut rand_core::OsRng);
    Argon2::default()
        .hash_password(password, &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| IdentityError::Backend(format!("password hashing failed: {e}")))
}

impl IdentityStore for FileIdentityStore {
    fn create(&self, username: &Username, password_hash: &str) -> Result<(), IdentityError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| IdentityError::Backend("identity store lock poisoned".into()))?;

        let mut records = self.load()?;
        if records.users.contains_key(username.as_str()) {
            return Err(IdentityError::AlreadyExists(username.to_string()));
        }
        records
            .users
            .insert(username.to_string(), password_hash.to_string());
        self.save(&records)?;

        tracing::info!("Created user {} in {}", username, self.path.display());
        Ok(())
    }

    fn password_hash(&self, username: &Username) -> Result<Option<String>, IdentityError> {
        Ok(self.load()?.users.remove(username.as_str()))
    }

    fn verify(&self, username: &Username, password: &[u8]) -> Result<bool, IdentityError> {
        let Some(stored) = self.password_hash(username)? else {
            return Ok(false);
        };
        let stored = Zeroizing::new(stored);
        let parsed = PasswordHash::new(&stored)
            .map_err(|e| IdentityError::Backend(format!("corrupt hash for {username}: {e}")))?;
        Ok(Argon2::default().verify_password(password, &parsed).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filemove_core::identity::authenticate;

    fn store() -> (tempfile::TempDir, FileIdentityStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIdentityStore::new(dir.path().join("users.json"));
        (dir, store)
    }

    #[test]
    fn test_register_and_authenticate() {
        let (_dir, store) = store();
        let alice = Username::new("alice").unwrap();
        store.register(&alice, b"correct horse").unwrap();

        assert!(store.verify(&alice, b"correct horse").unwrap());
        assert!(!store.verify(&alice, b"battery staple").unwrap());
        assert_eq!(authenticate(&store, "alice", b"correct horse").unwrap(), alice);
        assert!(matches!(
            authenticate(&store, "alice", b"wrong password"),
            Err(IdentityError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_unknown_user_fails_verification() {
        let (_dir, store) = store();
        let bob = Username::new("bob").unwrap();
        assert!(!store.verify(&bob, b"whatever1").unwrap());
        assert_eq!(store.password_hash(&bob).unwrap(), None);
    }

    #[test]
    fn test_duplicate_user_rejected() {
        let (_dir, store) = store();
        let alice = Username::new("alice").unwrap();
        store.register(&alice, b"password-one").unwrap();
        assert!(matches!(
            store.register(&alice, b"password-two"),
            Err(IdentityError::AlreadyExists(_))
        ));
        assert!(store.verify(&alice, b"password-one").unwrap());
    }

    #[test]
    fn test_short_password_rejected() {
        let (_dir, store) = store();
        let alice = Username::new("alice").unwrap();
        assert!(store.register(&alice, b"short").is_err());
        assert_eq!(store.password_hash(&alice).unwrap(), None);
    }

    #[test]
    fn test_hashes_are_salted_phc_strings() {
        let first = hash_password(b"same password").unwrap();
        let second = hash_password(b"same password").unwrap();
        assert!(first.starts_with("$argon2id$"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_store_survives_reopen() {
        let (dir, store) = store();
        let alice = Username::new("alice").unwrap();
        store.register(&alice, b"persistent").unwrap();
        drop(store);

        let reopened = FileIdentityStore::new(dir.path().join("users.json"));
        assert!(reopened.verify(&alice, b"persistent").unwrap());
    }

    #[test]
    fn test_corrupt_store_is_backend_error() {
        let (dir, store) = store();
        fs::write(dir.path().join("users.json"), b"not json").unwrap();
        let alice = Username::new("alice").unwrap();
        assert!(matches!(
            store.verify(&alice, b"anything"),
            Err(IdentityError::Backend(_))
        ));
    }
}
