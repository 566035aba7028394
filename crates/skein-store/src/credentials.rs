//! Credential lists for the login procedure

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{info, warn};

use skein_core::{Credential, SkeinError, SkeinResult};

/// Source of valid username/password pairs
pub trait CredentialStore: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> SkeinResult<bool>;
}

/// Credentials held in a JSON array file.
///
/// The file is re-read on every check, so edits take effect for the next login
/// without a restart.
#[derive(Debug)]
pub struct CredentialFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the list. A missing file is an empty list.
    pub fn load(&self) -> SkeinResult<Vec<Credential>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Add a user, replacing the password if the username already exists
    pub fn add_user(&self, credential: Credential) -> SkeinResult<()> {
        let _guard = self.write_lock.lock();
        let mut credentials = self.load()?;
        match credentials
            .iter_mut()
            .find(|c| c.username == credential.username)
        {
            Some(existing) => existing.password = credential.password,
            None => credentials.push(credential),
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(&credentials)?;
        fs::write(&self.path, body)?;
        info!(path = %self.path.display(), users = credentials.len(), "credential file written");
        Ok(())
    }
}

impl CredentialStore for CredentialFile {
    fn verify(&self, username: &str, password: &str) -> SkeinResult<bool> {
        let credentials = self.load().map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "credential file unreadable");
            SkeinError::Config(format!("credentials: {e}"))
        })?;
        Ok(matches_any(&credentials, username, password))
    }
}

/// A fixed credential list
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credentials: Vec<Credential>,
}

impl StaticCredentials {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }
}

impl CredentialStore for StaticCredentials {
    fn verify(&self, username: &str, password: &str) -> SkeinResult<bool> {
        Ok(matches_any(&self.credentials, username, password))
    }
}

fn matches_any(credentials: &[Credential], username: &str, password: &str) -> bool {
    credentials
        .iter()
        .any(|c| c.username == username && c.password == password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_rejects_everyone() {
        let tmp = tempfile::tempdir().unwrap();
        let file = CredentialFile::new(tmp.path().join("credentials.json"));
        assert!(!file.verify("kyle", "pw").unwrap());
    }

    #[test]
    fn test_add_user_then_verify() {
        let tmp = tempfile::tempdir().unwrap();
        let file = CredentialFile::new(tmp.path().join("data").join("credentials.json"));

        file.add_user(Credential::new("kyle", "pw")).unwrap();
        assert!(file.verify("kyle", "pw").unwrap());
        assert!(!file.verify("kyle", "wrong").unwrap());
        assert!(!file.verify("other", "pw").unwrap());
    }

    #[test]
    fn test_add_user_replaces_password() {
        let tmp = tempfile::tempdir().unwrap();
        let file = CredentialFile::new(tmp.path().join("credentials.json"));

        file.add_user(Credential::new("kyle", "old")).unwrap();
        file.add_user(Credential::new("kyle", "new")).unwrap();
        assert_eq!(file.load().unwrap().len(), 1);
        assert!(file.verify("kyle", "new").unwrap());
    }

    #[test]
    fn test_file_edits_apply_without_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("credentials.json");
        let file = CredentialFile::new(&path);
        assert!(!file.verify("kyle", "pw").unwrap());

        fs::write(&path, r#"[{"username":"kyle","password":"pw"}]"#).unwrap();
        assert!(file.verify("kyle", "pw").unwrap());
    }

    #[test]
    fn test_corrupt_file_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("credentials.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            CredentialFile::new(&path).verify("kyle", "pw"),
            Err(SkeinError::Config(_))
        ));
    }

    #[test]
    fn test_static_credentials() {
        let creds = StaticCredentials::new(vec![Credential::new("kyle", "pw")]);
        assert!(creds.verify("kyle", "pw").unwrap());
        assert!(!creds.verify("kyle", "nope").unwrap());
    }
}
