use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors that can occur while archiving an image.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to create archive directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write archived image {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Writes processed images into the date/hour partitioned archive tree
pub struct ImageArchiver {
    root: PathBuf,
}

impl ImageArchiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root of the archive tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generate the archive path for an image
    /// Format: {root}/{YYYY-MM-DD}/{HH}/{YYYYMMDD_HHMMSS}_{base_name}.jpeg
    ///
    /// Names only have second granularity: two images with the same base name
    /// in the same second share a path and the later one wins.
    pub fn archive_path<Tz>(&self, base_name: &str, at: &DateTime<Tz>) -> PathBuf
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        self.root
            .join(at.format("%Y-%m-%d").to_string())
            .join(at.format("%H").to_string())
            .join(format!(
                "{timestamp}_{name}.jpeg",
                timestamp = at.format("%Y%m%d_%H%M%S"),
                name = sanitize_path_component(base_name),
            ))
    }

    /// Write an encoded image into the archive and return its path
    #[instrument(skip(self, jpeg, at), fields(size_bytes = jpeg.len()))]
    pub async fn archive<Tz>(
        &self,
        jpeg: &[u8],
        base_name: &str,
        at: &DateTime<Tz>,
    ) -> Result<PathBuf, ArchiveError>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let path = self.archive_path(base_name, at);
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();

        // The retention sweep may remove an empty hour directory between
        // creating it and writing into it; one retry covers that window.
        let mut retried = false;
        loop {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| ArchiveError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;

            match tokio::fs::write(&path, jpeg).await {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::NotFound && !retried => {
                    debug!(dir = %dir.display(), "Archive directory vanished, recreating");
                    retried = true;
                }
                Err(source) => {
                    return Err(ArchiveError::Write {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }

        debug!(path = %path.display(), "Image archived");
        Ok(path)
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap()
    }

    #[test]
    fn test_archive_path_layout() {
        let archiver = ImageArchiver::new("/srv/archive");
        let path = archiver.archive_path("AB123CD", &at());

        assert_eq!(
            path,
            PathBuf::from("/srv/archive/2024-01-15/10/20240115_103045_AB123CD.jpeg")
        );
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("AB123CD"), "AB123CD");
        assert_eq!(sanitize_path_component("../etc"), "___etc");
        assert_eq!(sanitize_path_component("a b/c"), "a_b_c");
    }

    #[tokio::test]
    async fn test_archive_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = ImageArchiver::new(dir.path().join("archive"));

        let path = archiver.archive(b"jpeg-bytes", "AB123CD", &at()).await.unwrap();

        assert!(path.starts_with(dir.path().join("archive/2024-01-15/10")));
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg-bytes");
    }

    #[tokio::test]
    async fn test_archive_reuses_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = ImageArchiver::new(dir.path());

        let first = archiver.archive(b"one", "AAA111", &at()).await.unwrap();
        let later = at() + chrono::Duration::seconds(5);
        let second = archiver.archive(b"two", "AAA111", &later).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(first.parent(), second.parent());
        assert!(first.exists() && second.exists());
    }

    #[tokio::test]
    async fn test_same_second_same_plate_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = ImageArchiver::new(dir.path());

        let first = archiver.archive(b"one", "AAA111", &at()).await.unwrap();
        let second = archiver.archive(b"two", "AAA111", &at()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
    }
}
