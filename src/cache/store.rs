//! Artifact storage. The store treats the filesystem as an opaque object
//! store addressed by relative key paths under a base directory; the
//! artifact's modification time is the cache's only freshness signal.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, bail, ensure};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub(crate) const DEFAULT_DIR_MODE: u32 = 0o755;
pub(crate) const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stat {
    Missing,
    Directory,
    File { modified: SystemTime },
}

#[derive(Debug)]
pub(crate) struct Store {
    root: PathBuf,
    dir_mode: u32,
    file_mode: u32,
}

impl Store {
    /// Opens the store rooted at `root`, creating the directory when absent
    /// and resolving it to its canonical form.
    pub(crate) async fn open(root: PathBuf, dir_mode: u32, file_mode: u32) -> Result<Self> {
        match fs::metadata(&root).await {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                builder.mode(dir_mode);
                builder
                    .create(&root)
                    .await
                    .with_context(|| format!("failed to create cache dir {}", root.display()))?;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to stat cache dir {}", root.display()));
            }
            Ok(meta) if !meta.is_dir() => {
                bail!("base path {} is not a directory", root.display());
            }
            Ok(_) => {}
        }
        let root = fs::canonicalize(&root)
            .await
            .with_context(|| format!("failed to resolve cache dir {}", root.display()))?;
        Ok(Self {
            root,
            dir_mode,
            file_mode,
        })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        ensure!(!key.is_empty(), "cache key must not be empty");
        let relative = Path::new(key.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => bail!("cache key {key:?} must be a plain relative path"),
            }
        }
        Ok(self.root.join(relative))
    }

    pub(crate) async fn stat(&self, key: &str) -> Result<Stat> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Stat::Missing),
            Err(err) => Err(err)
                .with_context(|| format!("failed to stat cache artifact {}", path.display())),
            Ok(meta) if meta.is_dir() => Ok(Stat::Directory),
            Ok(meta) => Ok(Stat::File {
                modified: meta
                    .modified()
                    .with_context(|| format!("no modification time for {}", path.display()))?,
            }),
        }
    }

    /// Writes an artifact, creating parent directories as needed. The file
    /// is opened create+truncate+write so an interrupted earlier write is
    /// never extended.
    pub(crate) async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(self.dir_mode);
            builder
                .create(parent)
                .await
                .with_context(|| format!("failed to create cache dir {}", parent.display()))?;
        }
        let mut options = fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        options.mode(self.file_mode);
        let mut file = options
            .open(&path)
            .await
            .with_context(|| format!("failed to open cache artifact {}", path.display()))?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    pub(crate) async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        fs::read(&path)
            .await
            .with_context(|| format!("failed to read cache artifact {}", path.display()))
    }

    pub(crate) async fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to remove cache artifact {}", path.display()))
    }
}

/// Resolves the platform user cache directory joined with the application
/// name and any further segments, e.g. `~/.cache/<app>/<segments...>` on
/// Linux.
pub fn user_cache_dir<I, S>(app: &str, segments: I) -> Result<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut dir = platform_cache_dir()?;
    dir.push(app);
    for segment in segments {
        dir.push(segment.as_ref());
    }
    Ok(dir)
}

#[cfg(target_os = "macos")]
fn platform_cache_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join("Library").join("Caches"))
}

#[cfg(windows)]
fn platform_cache_dir() -> Result<PathBuf> {
    let local = std::env::var_os("LOCALAPPDATA").context("LOCALAPPDATA is not set")?;
    Ok(PathBuf::from(local))
}

#[cfg(not(any(target_os = "macos", windows)))]
fn platform_cache_dir() -> Result<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME") {
        if !xdg.is_empty() {
            return Ok(PathBuf::from(xdg));
        }
    }
    let home = std::env::var_os("HOME").context("neither XDG_CACHE_HOME nor HOME is set")?;
    Ok(PathBuf::from(home).join(".cache"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> Store {
        Store::open(
            dir.path().to_path_buf(),
            DEFAULT_DIR_MODE,
            DEFAULT_FILE_MODE,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;
        store.write("http/example.com/page", b"artifact").await?;
        let bytes = store.read("http/example.com/page").await?;
        assert_eq!(bytes, b"artifact");
        Ok(())
    }

    #[tokio::test]
    async fn write_truncates_previous_artifact() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;
        store.write("key", b"a longer first artifact").await?;
        store.write("key", b"short").await?;
        assert_eq!(store.read("key").await?, b"short");
        Ok(())
    }

    #[tokio::test]
    async fn stat_reports_missing_file_and_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;
        assert!(matches!(store.stat("absent").await?, Stat::Missing));

        store.write("present", b"x").await?;
        assert!(matches!(
            store.stat("present").await?,
            Stat::File { .. }
        ));

        std::fs::create_dir(dir.path().join("a-directory"))?;
        assert!(matches!(
            store.stat("a-directory").await?,
            Stat::Directory
        ));
        Ok(())
    }

    #[tokio::test]
    async fn remove_unlinks_the_artifact() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;
        store.write("key", b"x").await?;
        store.remove("key").await?;
        assert!(matches!(store.stat("key").await?, Stat::Missing));
        assert!(store.remove("key").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn keys_may_not_escape_the_root() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;
        assert!(store.read("../outside").await.is_err());
        assert!(store.write("a/../../outside", b"x").await.is_err());
        assert!(store.read("").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn open_creates_the_base_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().join("nested").join("cache");
        let store = Store::open(root.clone(), DEFAULT_DIR_MODE, DEFAULT_FILE_MODE).await?;
        assert!(root.is_dir());
        assert!(store.root().is_absolute());
        Ok(())
    }

    #[tokio::test]
    async fn open_rejects_a_file_as_base() -> Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x")?;
        let err = Store::open(file, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn artifacts_use_the_configured_modes() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new()?;
        let store = Store::open(dir.path().to_path_buf(), 0o700, 0o600).await?;
        store.write("shard/key", b"x").await?;

        let dir_mode = std::fs::metadata(dir.path().join("shard"))?
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
        let file_mode = std::fs::metadata(dir.path().join("shard/key"))?
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
        Ok(())
    }

    #[test]
    fn user_cache_dir_joins_app_and_segments() {
        let dir = user_cache_dir("wirestash", ["profiles", "default"]).unwrap();
        let text = dir.to_string_lossy().into_owned();
        assert!(text.ends_with("wirestash/profiles/default") || text.contains("wirestash"));
    }
}
