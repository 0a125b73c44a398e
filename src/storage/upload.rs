use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{info, warn};

/// Reduce a client-supplied filename to a safe, lowercase display name.
///
/// Only the last path component is kept. Characters other than letters,
/// digits, `_`, `-` and `.` become `_`. The extension survives.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let (stem, ext) = match base.rfind('.') {
        Some(idx) if idx > 0 => (&base[..idx], &base[idx..]),
        _ => (base, ""),
    };

    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
            .collect()
    };

    let mut name = format!("{}{}", clean(stem), clean(ext)).to_lowercase();
    // a bare "." or ".." must never reach the filesystem
    if name.chars().all(|c| c == '.') {
        name = format!("upload{}", name.trim_matches('.'));
    }
    if name.is_empty() {
        name = "upload".to_string();
    }
    name
}

/// On-disk name for a task's upload: `{id}_{sanitized_filename}`.
pub fn storage_name(task_id: &str, sanitized_filename: &str) -> String {
    format!("{}_{}", task_id, sanitized_filename)
}

#[derive(Debug, thiserror::Error)]
#[error("unsafe storage file name: {0}")]
pub struct UnsafeFileName(pub String);

/// A stored upload found while scanning the directory.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// The durable directory holding uploads of unfinished tasks.
#[derive(Debug, Clone)]
pub struct UploadDir {
    root: PathBuf,
}

impl UploadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = Self::new(root);
        tokio::fs::create_dir_all(&dir.root).await?;
        info!("Upload directory ready at {}", dir.root.display());
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage name taken from a queue message back to a path.
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf, UnsafeFileName> {
        let unsafe_name = file_name.is_empty()
            || file_name == "."
            || file_name == ".."
            || file_name.contains('/')
            || file_name.contains('\\')
            || file_name.contains('\0');
        if unsafe_name {
            return Err(UnsafeFileName(file_name.to_string()));
        }
        Ok(self.root.join(file_name))
    }

    pub fn path_for(&self, task_id: &str, sanitized_filename: &str) -> PathBuf {
        self.root.join(storage_name(task_id, sanitized_filename))
    }

    /// Returns whether a file was removed. A missing file is not an error.
    pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self) -> io::Result<Vec<StoredFile>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Failed to stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            files.push(StoredFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_extension_and_lowercases() {
        assert_eq!(sanitize_filename("My Song (Live).MP3"), "my_song__live_.mp3");
        assert_eq!(sanitize_filename("a.wav"), "a.wav");
        assert_eq!(sanitize_filename("会议 记录.m4a"), "会议_记录.m4a");
    }

    #[test]
    fn test_sanitize_strips_paths() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\voice.ogg"), "voice.ogg");
        assert_eq!(sanitize_filename(".."), "upload");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("dir/"), "upload");
    }

    #[test]
    fn test_storage_name() {
        assert_eq!(storage_name("abc", "a.wav"), "abc_a.wav");
        let dir = UploadDir::new("/data/uploads");
        assert_eq!(dir.path_for("abc", "a.wav"), PathBuf::from("/data/uploads/abc_a.wav"));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = UploadDir::new("/data/uploads");
        assert!(dir.resolve("../secret").is_err());
        assert!(dir.resolve("sub/file.wav").is_err());
        assert!(dir.resolve("").is_err());
        assert!(dir.resolve("..").is_err());
        assert!(dir.resolve("id_my..song.wav").is_ok());
        assert_eq!(dir.resolve("id_a.wav").unwrap(), PathBuf::from("/data/uploads/id_a.wav"));
    }

    #[tokio::test]
    async fn test_remove_if_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = UploadDir::create(tmp.path().join("uploads")).await.unwrap();
        let path = dir.path_for("id", "a.wav");
        std::fs::write(&path, b"data").unwrap();

        assert_eq!(dir.list().await.unwrap().len(), 1);
        assert!(UploadDir::remove_if_exists(&path).unwrap());
        assert!(!UploadDir::remove_if_exists(&path).unwrap());
        assert!(dir.list().await.unwrap().is_empty());
    }
}
