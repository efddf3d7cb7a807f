use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Flat append-only log of recognized plates, one `<timestamp>,<plate>` per line.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best effort: failures are logged, never returned.
    pub async fn append(&self, recognized_at: DateTime<Utc>, plate: &str) {
        let line = format_line(recognized_at, plate);

        if let Err(e) = self.write_line(&line).await {
            warn!(path = %self.path.display(), error = %e, "Failed to write audit log line");
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

fn format_line(recognized_at: DateTime<Utc>, plate: &str) -> String {
    format!(
        "{},{}\n",
        recognized_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        plate
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_line() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        assert_eq!(format_line(at, "AB123CD"), "2024-01-15T10:30:45Z,AB123CD\n");
    }

    #[tokio::test]
    async fn test_append_creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("logs/plates.txt"));
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();

        log.append(at, "AAA111").await;
        log.append(at, "BBB222").await;

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(
            contents,
            "2024-01-15T10:30:45Z,AAA111\n2024-01-15T10:30:45Z,BBB222\n"
        );
    }

    #[tokio::test]
    async fn test_append_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let log = AuditLog::new(dir.path());
        log.append(Utc::now(), "AAA111").await;
    }
}
