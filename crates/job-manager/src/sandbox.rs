//! Content-addressed runtime archives shared by every workflow using the same release.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use ahash::HashMap;
use error_stack::{Report, ResultExt};
use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{event, instrument, Level};
use walkdir::WalkDir;

/// The name under which the sandbox archive is staged into every job.
pub const SANDBOX_STAGED_NAME: &str = "sandbox.tar.gz";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to hash sandbox contents")]
    Hash,
    #[error("Failed to package sandbox")]
    Package,
    #[error("Failed to recycle sandbox")]
    Recycle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    /// Content hash of the packaged tree, or of the recycled archive.
    pub version: String,
    pub archive: PathBuf,
}

/// Builds sandbox archives into one directory. Requests for a version that is already being
/// built wait for that build instead of starting another one.
#[derive(Debug)]
pub struct SandboxManager {
    dir: PathBuf,
    builds: parking_lot::Mutex<HashMap<String, Arc<OnceCell<Sandbox>>>>,
}

impl SandboxManager {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            builds: parking_lot::Mutex::new(HashMap::default()),
        }
    }

    fn build_cell(&self, version: &str) -> Arc<OnceCell<Sandbox>> {
        self.builds
            .lock()
            .entry(version.to_string())
            .or_default()
            .clone()
    }

    fn archive_path(&self, version: &str) -> PathBuf {
        self.dir.join(format!("sandbox-{version}.tar.gz"))
    }

    /// Package a release area, skipping paths that start with a blacklisted prefix.
    #[instrument(level = "debug", skip(self))]
    pub async fn package(
        &self,
        release: &Path,
        blacklist: &[String],
    ) -> Result<Sandbox, Report<SandboxError>> {
        let version = {
            let release = release.to_path_buf();
            let blacklist = blacklist.to_vec();
            tokio::task::spawn_blocking(move || hash_tree(&release, &blacklist))
                .await
                .change_context(SandboxError::Hash)??
        };

        let cell = self.build_cell(&version);
        let sandbox = cell
            .get_or_try_init(|| async {
                let archive = self.archive_path(&version);
                if tokio::fs::try_exists(&archive).await.unwrap_or(false) {
                    event!(Level::INFO, %version, archive=%archive.display(), "reusing packaged sandbox");
                } else {
                    event!(Level::INFO, %version, release=%release.display(), "packaging sandbox");
                    let dir = self.dir.clone();
                    let release = release.to_path_buf();
                    let blacklist = blacklist.to_vec();
                    let target = archive.clone();
                    tokio::task::spawn_blocking(move || {
                        build_archive(&dir, &release, &blacklist, &target)
                    })
                    .await
                    .change_context(SandboxError::Package)??;
                }

                Ok::<_, Report<SandboxError>>(Sandbox {
                    version: version.clone(),
                    archive,
                })
            })
            .await?;

        Ok(sandbox.clone())
    }

    /// Reuse an existing archive. It is copied into the sandbox directory the first time its
    /// version is seen.
    #[instrument(level = "debug", skip(self))]
    pub async fn recycle(&self, archive: &Path) -> Result<Sandbox, Report<SandboxError>> {
        let version = {
            let archive = archive.to_path_buf();
            tokio::task::spawn_blocking(move || hash_file(&archive))
                .await
                .change_context(SandboxError::Hash)??
        };

        let cell = self.build_cell(&version);
        let sandbox = cell
            .get_or_try_init(|| async {
                let target = self.archive_path(&version);
                if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    event!(Level::INFO, %version, source=%archive.display(), "recycling sandbox");
                    tokio::fs::create_dir_all(&self.dir)
                        .await
                        .change_context(SandboxError::Recycle)?;
                    tokio::fs::copy(archive, &target)
                        .await
                        .change_context(SandboxError::Recycle)
                        .attach_printable_lazy(|| archive.display().to_string())?;
                }

                Ok::<_, Report<SandboxError>>(Sandbox {
                    version: version.clone(),
                    archive: target,
                })
            })
            .await?;

        Ok(sandbox.clone())
    }
}

fn is_blacklisted(relative: &Path, blacklist: &[String]) -> bool {
    blacklist
        .iter()
        .any(|prefix| relative.starts_with(prefix))
}

/// Walk a tree in a stable order, yielding every entry below the root with its relative path.
fn walk_release<'a>(
    root: &'a Path,
    blacklist: &'a [String],
) -> impl Iterator<Item = Result<(walkdir::DirEntry, PathBuf), walkdir::Error>> + 'a {
    WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            !is_blacklisted(relative, blacklist)
        })
        .map(move |entry| {
            entry.map(|entry| {
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(entry.path())
                    .to_path_buf();
                (entry, relative)
            })
        })
}

fn short_digest(hasher: Sha256) -> String {
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn hash_tree(root: &Path, blacklist: &[String]) -> Result<String, Report<SandboxError>> {
    let mut hasher = Sha256::new();
    for entry in walk_release(root, blacklist) {
        let (entry, relative) = entry
            .change_context(SandboxError::Hash)
            .attach_printable_lazy(|| root.display().to_string())?;
        if !entry.file_type().is_file() {
            continue;
        }

        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let mut file = File::open(entry.path())
            .change_context(SandboxError::Hash)
            .attach_printable_lazy(|| entry.path().display().to_string())?;
        std::io::copy(&mut file, &mut hasher)
            .change_context(SandboxError::Hash)
            .attach_printable_lazy(|| entry.path().display().to_string())?;
    }

    Ok(short_digest(hasher))
}

fn hash_file(path: &Path) -> Result<String, Report<SandboxError>> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)
        .change_context(SandboxError::Hash)
        .attach_printable_lazy(|| path.display().to_string())?;
    std::io::copy(&mut file, &mut hasher)
        .change_context(SandboxError::Hash)
        .attach_printable_lazy(|| path.display().to_string())?;

    Ok(short_digest(hasher))
}

fn build_archive(
    dir: &Path,
    release: &Path,
    blacklist: &[String],
    target: &Path,
) -> Result<(), Report<SandboxError>> {
    std::fs::create_dir_all(dir).change_context(SandboxError::Package)?;

    let prefix = release
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("release"));
    let partial = target.with_extension("partial");
    let file = File::create(&partial)
        .change_context(SandboxError::Package)
        .attach_printable_lazy(|| partial.display().to_string())?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    for entry in walk_release(release, blacklist) {
        let (entry, relative) = entry.change_context(SandboxError::Package)?;
        builder
            .append_path_with_name(entry.path(), prefix.join(&relative))
            .change_context(SandboxError::Package)
            .attach_printable_lazy(|| entry.path().display().to_string())?;
    }

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .change_context(SandboxError::Package)?;
    std::fs::rename(&partial, target).change_context(SandboxError::Package)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(dir: &Path) -> PathBuf {
        let release = dir.join("CMSSW_1");
        std::fs::create_dir_all(release.join("src/analysis")).unwrap();
        std::fs::create_dir_all(release.join("tmp")).unwrap();
        std::fs::write(release.join("src/analysis/module.py"), "process = 1").unwrap();
        std::fs::write(release.join("tmp/scratch"), "ignored").unwrap();
        release
    }

    #[tokio::test]
    async fn package_is_reused_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let release = release(dir.path());
        let manager = SandboxManager::new(dir.path().join("sandboxes"));
        let blacklist = vec!["tmp".to_string()];

        let first = manager.package(&release, &blacklist).await.unwrap();
        assert!(first.archive.exists());

        // A fresh manager finds the archive on disk instead of building it again.
        let other = SandboxManager::new(dir.path().join("sandboxes"));
        let second = other.package(&release, &blacklist).await.unwrap();
        assert_eq!(first, second);

        std::fs::write(release.join("tmp/scratch"), "changed").unwrap();
        let third = manager.package(&release, &blacklist).await.unwrap();
        assert_eq!(first.version, third.version, "blacklisted files are not hashed");

        std::fs::write(release.join("src/analysis/module.py"), "process = 2").unwrap();
        let fourth = manager.package(&release, &blacklist).await.unwrap();
        assert_ne!(first.version, fourth.version);
    }

    #[tokio::test]
    async fn concurrent_packages_share_one_build() {
        let dir = tempfile::tempdir().unwrap();
        let release = release(dir.path());
        let manager = SandboxManager::new(dir.path().join("sandboxes"));

        let (a, b) = tokio::join!(
            manager.package(&release, &[]),
            manager.package(&release, &[])
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(manager.builds.lock().len(), 1);
    }

    #[tokio::test]
    async fn recycle_copies_archive() {
        let dir = tempfile::tempdir().unwrap();
        let release = release(dir.path());
        let packaged = SandboxManager::new(dir.path().join("old"))
            .package(&release, &[])
            .await
            .unwrap();

        let manager = SandboxManager::new(dir.path().join("new"));
        let recycled = manager.recycle(&packaged.archive).await.unwrap();
        assert!(recycled.archive.starts_with(dir.path().join("new")));
        assert!(recycled.archive.exists());

        let again = manager.recycle(&packaged.archive).await.unwrap();
        assert_eq!(recycled, again);
    }
}
