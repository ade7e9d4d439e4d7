//! Per-project access control.
//!
//! A project directory may hold an `auth.txt` file with one
//! `user, password, flags` entry per line. Without the file a project is
//! readable by anyone and writable by no one. With it, a reader needs a
//! matching user and password (or a `*` entry, which admits everyone), and
//! a writer additionally needs the flags field to be exactly `w`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

/// Name of the credentials file inside a project directory.
pub const AUTH_FILE: &str = "auth.txt";

/// Requested access level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// User-supplied credentials. Both parts are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Decides whether credentials grant access to a project directory.
pub trait AuthorizationPolicy: Send + Sync {
    fn authorize(&self, project_dir: &Path, credentials: &Credentials, mode: AccessMode) -> bool;
}

/// Policy backed by `auth.txt` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatFileAuth;

#[derive(Debug, PartialEq)]
struct Entry {
    password: String,
    flags: String,
}

fn parse_auth_file(text: &str) -> Option<HashMap<String, Entry>> {
    let mut users = HashMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [user, password, flags] = fields.as_slice() else {
            return None;
        };
        users.insert(
            user.to_string(),
            Entry {
                password: password.to_string(),
                flags: flags.to_string(),
            },
        );
    }
    Some(users)
}

impl AuthorizationPolicy for FlatFileAuth {
    fn authorize(&self, project_dir: &Path, credentials: &Credentials, mode: AccessMode) -> bool {
        let path = project_dir.join(AUTH_FILE);
        if !path.is_file() {
            return mode == AccessMode::Read;
        }
        let users = match fs::read_to_string(&path).ok().as_deref().and_then(parse_auth_file) {
            Some(users) => users,
            None => {
                warn!(path = %path.display(), "malformed auth file, denying access");
                return false;
            }
        };

        if mode == AccessMode::Read && users.contains_key("*") {
            return true;
        }
        let (Some(user), Some(password)) = (&credentials.username, &credentials.password) else {
            debug!(path = %path.display(), "no credentials supplied");
            return false;
        };
        match users.get(user) {
            Some(entry) if &entry.password == password => match mode {
                AccessMode::Read => true,
                AccessMode::Write => entry.flags == "w",
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(contents: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        if let Some(text) = contents {
            fs::write(dir.path().join(AUTH_FILE), text).unwrap();
        }
        dir
    }

    #[test]
    fn no_auth_file_is_read_only() {
        let dir = project(None);
        let anon = Credentials::anonymous();
        assert!(FlatFileAuth.authorize(dir.path(), &anon, AccessMode::Read));
        assert!(!FlatFileAuth.authorize(dir.path(), &anon, AccessMode::Write));
    }

    #[test]
    fn credentials_and_flags() {
        let dir = project(Some("alice, secret, w\nbob, hunter2, r\ncarol, pw, rw\n"));
        let alice = Credentials::new("alice", "secret");
        let bob = Credentials::new("bob", "hunter2");
        let wrong = Credentials::new("alice", "nope");
        assert!(FlatFileAuth.authorize(dir.path(), &alice, AccessMode::Write));
        assert!(FlatFileAuth.authorize(dir.path(), &bob, AccessMode::Read));
        assert!(!FlatFileAuth.authorize(dir.path(), &bob, AccessMode::Write));
        let carol = Credentials::new("carol", "pw");
        assert!(FlatFileAuth.authorize(dir.path(), &carol, AccessMode::Read));
        assert!(!FlatFileAuth.authorize(dir.path(), &carol, AccessMode::Write));
        assert!(!FlatFileAuth.authorize(dir.path(), &wrong, AccessMode::Read));
        assert!(!FlatFileAuth.authorize(dir.path(), &Credentials::anonymous(), AccessMode::Read));
    }

    #[test]
    fn wildcard_admits_readers() {
        let dir = project(Some("*, , r\nadmin, pw, w\n"));
        let anon = Credentials::anonymous();
        assert!(FlatFileAuth.authorize(dir.path(), &anon, AccessMode::Read));
        assert!(!FlatFileAuth.authorize(dir.path(), &anon, AccessMode::Write));
    }

    #[test]
    fn malformed_file_denies() {
        let dir = project(Some("alice secret w\n"));
        let alice = Credentials::new("alice", "secret");
        assert!(!FlatFileAuth.authorize(dir.path(), &alice, AccessMode::Read));
    }
}
