// Per-job artifacts on disk
//
// <scripts_dir>/<job_id>/script.py   user script
// <scripts_dir>/<job_id>/run.sh      bootstrap
// <scripts_dir>/<job_id>/output/     files the script produces
// <logs_dir>/<job_id>/output.log     captured output, written at finalize

use scriptbox_common::types::JobId;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultFile {
    /// Path relative to the output directory
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    scripts_dir: PathBuf,
    logs_dir: PathBuf,
}

impl Workspace {
    pub fn new(scripts_dir: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            logs_dir: logs_dir.into(),
        }
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.scripts_dir.join(job_id.to_string())
    }

    pub fn output_dir(&self, job_id: JobId) -> PathBuf {
        self.job_dir(job_id).join("output")
    }

    pub fn log_path(&self, job_id: JobId) -> PathBuf {
        self.logs_dir.join(job_id.to_string()).join("output.log")
    }

    /// Write the script and bootstrap, create the output directory, and return the
    /// absolute job directory for bind mounting.
    pub async fn prepare(&self, job_id: JobId, script: &str, run_script: &str) -> io::Result<PathBuf> {
        let job_dir = self.job_dir(job_id);
        fs::create_dir_all(job_dir.join("output")).await?;
        fs::write(job_dir.join("script.py"), script).await?;
        fs::write(job_dir.join("run.sh"), normalize_newlines(run_script)).await?;
        fs::canonicalize(&job_dir).await
    }

    pub async fn write_log(&self, job_id: JobId, lines: &[String]) -> io::Result<PathBuf> {
        let path = self.log_path(job_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(&path, content).await?;
        Ok(path)
    }

    /// Persisted log lines, or `None` when no log was written
    pub async fn read_log_lines(&self, job_id: JobId) -> io::Result<Option<Vec<String>>> {
        match fs::read_to_string(self.log_path(job_id)).await {
            Ok(content) => Ok(Some(content.lines().map(str::to_string).collect())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Last `tail` lines of the persisted log, or all of it
    pub async fn tail_log(&self, job_id: JobId, tail: Option<usize>) -> io::Result<Option<String>> {
        let lines = match self.read_log_lines(job_id).await? {
            Some(lines) => lines,
            None => return Ok(None),
        };
        let start = match tail {
            Some(n) => lines.len().saturating_sub(n),
            None => 0,
        };
        Ok(Some(lines[start..].join("\n")))
    }

    pub async fn list_results(&self, job_id: JobId) -> io::Result<Vec<ResultFile>> {
        let root = self.output_dir(job_id);
        let mut files = Vec::new();
        let mut pending = vec![root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                } else if meta.is_file() {
                    files.push(ResultFile {
                        name: relative_name(&root, &path),
                        size_bytes: meta.len(),
                    });
                }
            }
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Remove the job directory and its log; missing paths are fine
    pub async fn remove(&self, job_id: JobId) -> io::Result<()> {
        for dir in [self.job_dir(job_id), self.logs_dir.join(job_id.to_string())] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn workspace(dir: &tempfile::TempDir) -> Workspace {
        Workspace::new(dir.path().join("scripts"), dir.path().join("logs"))
    }

    #[tokio::test]
    async fn test_prepare_layout() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(&dir);
        let id = Uuid::new_v4();

        let job_dir = ws.prepare(id, "print(1)\n", "echo hi\r\n").await.unwrap();
        assert!(job_dir.is_absolute());
        assert_eq!(
            std::fs::read_to_string(job_dir.join("script.py")).unwrap(),
            "print(1)\n"
        );
        assert_eq!(
            std::fs::read_to_string(job_dir.join("run.sh")).unwrap(),
            "echo hi\n"
        );
        assert!(job_dir.join("output").is_dir());
    }

    #[tokio::test]
    async fn test_log_roundtrip_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(&dir);
        let id = Uuid::new_v4();

        assert!(ws.read_log_lines(id).await.unwrap().is_none());

        let lines: Vec<String> = (1..=5).map(|i| format!("line {}", i)).collect();
        let path = ws.write_log(id, &lines).await.unwrap();
        assert!(path.ends_with(format!("{}/output.log", id)));

        assert_eq!(ws.read_log_lines(id).await.unwrap().unwrap(), lines);
        assert_eq!(
            ws.tail_log(id, Some(2)).await.unwrap().unwrap(),
            "line 4\nline 5"
        );
        assert_eq!(ws.tail_log(id, Some(50)).await.unwrap().unwrap().lines().count(), 5);
    }

    #[tokio::test]
    async fn test_list_results_nested() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(&dir);
        let id = Uuid::new_v4();
        ws.prepare(id, "", "").await.unwrap();

        let out = ws.output_dir(id);
        std::fs::write(out.join("b.csv"), "a,b\n").unwrap();
        std::fs::create_dir_all(out.join("plots")).unwrap();
        std::fs::write(out.join("plots/a.png"), [0u8; 10]).unwrap();

        let files = ws.list_results(id).await.unwrap();
        assert_eq!(
            files,
            vec![
                ResultFile {
                    name: "b.csv".into(),
                    size_bytes: 4
                },
                ResultFile {
                    name: "plots/a.png".into(),
                    size_bytes: 10
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(&dir);
        let id = Uuid::new_v4();
        ws.prepare(id, "x", "y").await.unwrap();
        ws.write_log(id, &["done".to_string()]).await.unwrap();

        ws.remove(id).await.unwrap();
        assert!(!ws.job_dir(id).exists());
        assert!(ws.read_log_lines(id).await.unwrap().is_none());
        ws.remove(id).await.unwrap();
        assert!(ws.list_results(id).await.unwrap().is_empty());
    }
}
