use async_trait::async_trait;
use fnrun_common::{FnrunError, FunctionId, Language, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where handler source lives on the host. Only the registry writes; the
/// provisioner reads to confirm a handler is present before mounting it.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Directory that holds (or will hold) the handler for `id`.
    fn location_for(&self, id: FunctionId) -> PathBuf;

    /// Handler bytes, or `CodeNotFound` when the file is absent or unreadable.
    async fn read(&self, handler_path: &Path) -> Result<Vec<u8>>;

    /// Writes the entry point of a brand-new function. Fails with
    /// `AlreadyExists` when the directory for `id` is already on disk.
    async fn create_handler(
        &self,
        id: FunctionId,
        language: Language,
        source: &[u8],
    ) -> Result<PathBuf>;

    /// Writes the entry point for `language` and returns the code directory.
    async fn write_handler(
        &self,
        id: FunctionId,
        language: Language,
        source: &[u8],
    ) -> Result<PathBuf>;

    async fn remove(&self, code_location: &Path) -> Result<()>;
}

/// Filesystem code store rooted at `functions_dir`.
#[derive(Debug, Clone)]
pub struct FsCodeStore {
    root: PathBuf,
}

impl FsCodeStore {
    /// Creates the root if needed and canonicalizes it so bind mounts get absolute paths.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root).await?;
        let root = tokio::fs::canonicalize(root).await?;
        debug!(root = %root.display(), "Code store ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn place_handler(
        &self,
        id: FunctionId,
        dir: PathBuf,
        language: Language,
        source: &[u8],
    ) -> Result<PathBuf> {
        // A language change leaves the old entry point behind otherwise
        for stale in [Language::Python, Language::Javascript] {
            if stale != language {
                match tokio::fs::remove_file(dir.join(stale.handler_file())).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let handler = dir.join(language.handler_file());
        tokio::fs::write(&handler, source).await?;

        // Sandboxes run as an arbitrary user; the mount must stay readable
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).await?;
            tokio::fs::set_permissions(&handler, std::fs::Permissions::from_mode(0o644)).await?;
        }

        debug!(function_id = id, path = %handler.display(), bytes = source.len(), "Handler written");
        Ok(dir)
    }
}

#[async_trait]
impl CodeStore for FsCodeStore {
    fn location_for(&self, id: FunctionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    async fn read(&self, handler_path: &Path) -> Result<Vec<u8>> {
        match tokio::fs::read(handler_path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => Err(FnrunError::CodeNotFound(format!(
                "{}: {e}",
                handler_path.display()
            ))),
        }
    }

    async fn create_handler(
        &self,
        id: FunctionId,
        language: Language,
        source: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.location_for(id);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(FnrunError::AlreadyExists(format!(
                    "code directory {} is already present",
                    dir.display()
                )))
            }
            Err(e) => return Err(e.into()),
        }
        self.place_handler(id, dir, language, source).await
    }

    async fn write_handler(
        &self,
        id: FunctionId,
        language: Language,
        source: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.location_for(id);
        tokio::fs::create_dir_all(&dir).await?;
        self.place_handler(id, dir, language, source).await
    }

    async fn remove(&self, code_location: &Path) -> Result<()> {
        if !code_location.starts_with(&self.root) {
            warn!(path = %code_location.display(), "Refusing to remove code outside the functions directory");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(code_location).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnrun_common::ErrorKind;

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCodeStore::open(dir.path().join("functions")).await.unwrap();
        assert!(store.root().is_absolute());

        let location = store
            .write_handler(4, Language::Python, b"print('{}')")
            .await
            .unwrap();
        assert_eq!(location, store.location_for(4));

        let bytes = store.read(&location.join("handler.py")).await.unwrap();
        assert_eq!(bytes, b"print('{}')");

        store.remove(&location).await.unwrap();
        let err = store.read(&location.join("handler.py")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodeNotFound);

        // Removing twice is fine
        store.remove(&location).await.unwrap();
    }

    #[tokio::test]
    async fn test_language_change_replaces_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCodeStore::open(dir.path()).await.unwrap();
        store
            .write_handler(1, Language::Python, b"print(1)")
            .await
            .unwrap();
        let location = store
            .write_handler(1, Language::Javascript, b"console.log(1)")
            .await
            .unwrap();
        assert!(location.join("handler.js").exists());
        assert!(!location.join("handler.py").exists());
    }

    #[tokio::test]
    async fn test_create_refuses_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCodeStore::open(dir.path()).await.unwrap();
        std::fs::create_dir(dir.path().join("3")).unwrap();
        std::fs::write(dir.path().join("3/handler.py"), "ORIGINAL").unwrap();

        let err = store
            .create_handler(3, Language::Python, b"print('new')")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("3/handler.py")).unwrap(),
            "ORIGINAL"
        );

        let location = store
            .create_handler(4, Language::Python, b"print('new')")
            .await
            .unwrap();
        assert!(location.join("handler.py").exists());
    }

    #[tokio::test]
    async fn test_remove_ignores_foreign_paths() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let store = FsCodeStore::open(dir.path()).await.unwrap();
        store.remove(outside.path()).await.unwrap();
        assert!(outside.path().exists());
    }
}
