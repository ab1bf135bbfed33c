//! OAuth2 Token Persistence
//!
//! Stores the OAuth2 [`Token`] as JSON in a single file so a later run can
//! reuse or refresh it without repeating the browser flow.
//!
//! ## Security
//!
//! - The file is created with mode `0600` and its directory with `0700` (unix)
//! - Writes go to a sibling temp file that is renamed over the target, so a
//!   crash never leaves a truncated token file behind
//! - Token values are never logged; only the file name is
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::{Token, TokenStore};
//!
//! # async fn example() -> core_auth::Result<()> {
//! let store = TokenStore::new("/home/me/.config/tts/oauth2_token.json");
//! store.save(&Token::new("ya29.a0".to_string(), Some("1//0g".to_string()), 3600)).await?;
//!
//! if let Some(token) = store.load().await? {
//!     assert!(token.has_refresh_token());
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::types::Token;
use core_runtime::logging::strip_path;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[cfg(unix)]
const TOKEN_FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const TOKEN_DIR_MODE: u32 = 0o700;

/// File-backed store for a single OAuth2 token.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Load the persisted token.
    ///
    /// Returns `Ok(None)` when the file does not exist. A file that exists
    /// but cannot be parsed is an error; it is left in place so the user can
    /// inspect it.
    pub async fn load(&self) -> Result<Option<Token>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(file = %self.file_name(), "No stored OAuth2 token");
                return Ok(None);
            }
            Err(e) => {
                warn!(file = %self.file_name(), error = %e, "Failed to read token file");
                return Err(self.store_error(e));
            }
        };

        let token: Token = serde_json::from_slice(&data).map_err(|e| {
            warn!(file = %self.file_name(), error = %e, "Token file is corrupt");
            AuthError::SerializationFailed {
                context: format!("parsing token file {}", self.file_name()),
                source: e,
            }
        })?;

        debug!(
            file = %self.file_name(),
            has_refresh_token = token.has_refresh_token(),
            "Loaded stored OAuth2 token"
        );
        Ok(Some(token))
    }

    /// Persist `token`, replacing any previous file.
    pub async fn save(&self, token: &Token) -> Result<()> {
        let json = serde_json::to_vec_pretty(token).map_err(|e| AuthError::SerializationFailed {
            context: "token serialization".to_string(),
            source: e,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dir(parent)
                .await
                .map_err(|e| AuthError::TokenStore {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let tmp_path = self.tmp_path();
        if let Err(e) = write_private_file(&tmp_path, &json).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            warn!(file = %self.file_name(), error = %e, "Failed to write token file");
            return Err(self.store_error(e));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            warn!(file = %self.file_name(), error = %e, "Failed to replace token file");
            return Err(self.store_error(e));
        }

        info!(
            file = %self.file_name(),
            has_refresh_token = token.has_refresh_token(),
            "OAuth2 token saved"
        );
        Ok(())
    }

    /// Remove the token file. A missing file is not an error.
    pub async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(file = %self.file_name(), "OAuth2 token file deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.store_error(e)),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn file_name(&self) -> String {
        strip_path(&self.path.to_string_lossy()).to_string()
    }

    fn store_error(&self, source: std::io::Error) -> AuthError {
        AuthError::TokenStore {
            path: self.path.clone(),
            source,
        }
    }
}

async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(TOKEN_DIR_MODE);
    builder.create(dir).await
}

async fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(TOKEN_FILE_MODE);

    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;

    // The mode above only applies on creation; tighten a pre-existing file too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(TOKEN_FILE_MODE))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_token() -> Token {
        Token::new(
            "ya29.access".to_string(),
            Some("1//refresh".to_string()),
            3600,
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("oauth2_token.json"));

        let token = sample_token();

        assert!(!store.exists().await);
        store.save(&token).await.unwrap();
        assert!(store.exists().await);

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, token);
        assert_eq!(loaded.refresh_token.as_deref(), Some("1//refresh"));
        assert!(loaded.is_valid());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("absent.json"));

        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oauth2_token.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = TokenStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, AuthError::SerializationFailed { .. }));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_save_creates_nested_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("tts").join("oauth2_token.json");
        let store = TokenStore::new(&path);

        store.save(&sample_token()).await.unwrap();
        assert!(path.exists());
        assert!(!store.tmp_path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_and_directory_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let token_dir = dir.path().join("tts");
        let path = token_dir.join("oauth2_token.json");

        TokenStore::new(&path).save(&sample_token()).await.unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let dir_mode = std::fs::metadata(&token_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_overwrite_tightens_existing_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oauth2_token.json");
        std::fs::write(&path, b"{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        TokenStore::new(&path).save(&sample_token()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("oauth2_token.json"));

        store.delete().await.unwrap();
        store.save(&sample_token()).await.unwrap();
        store.delete().await.unwrap();
        assert!(!store.exists().await);
    }
}
