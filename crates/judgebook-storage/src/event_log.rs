use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use judgebook_core::GradingEvent;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// What to do when a week's log already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegradePolicy {
    #[default]
    Refuse,
    /// Rename the existing log aside, then start a fresh one.
    Archive,
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log {} already exists; rerun with --force to archive it and regrade", .path.display())]
    AlreadyExists { path: PathBuf },
    #[error("event log {} does not exist", .path.display())]
    NotFound { path: PathBuf },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed event on line {line} of {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode grading event: {0}")]
    Encode(#[source] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> EventLogError + '_ {
    move |source| EventLogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn log_path(data_dir: &Path, week_num: u32) -> PathBuf {
    data_dir.join(format!("grade_{week_num}.log"))
}

/// `grade_3.log` -> `grade_3.20220123T050000.log`.
pub fn archive_path(path: &Path, archived_at: DateTime<Utc>) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "grade".to_string());
    let stamp = archived_at.format("%Y%m%dT%H%M%S");
    path.with_file_name(format!("{stem}.{stamp}.log"))
}

/// Append-only JSON-lines log of grading decisions for one week.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: fs::File,
    appended: usize,
}

impl EventLog {
    pub async fn open_fresh(path: impl Into<PathBuf>, policy: RegradePolicy) -> Result<Self, EventLogError> {
        let path = path.into();

        if fs::try_exists(&path).await.map_err(io_error(&path))? {
            match policy {
                RegradePolicy::Refuse => return Err(EventLogError::AlreadyExists { path }),
                RegradePolicy::Archive => {
                    let archived = archive_path(&path, Utc::now());
                    fs::rename(&path, &archived).await.map_err(io_error(&path))?;
                    info!(from = %path.display(), to = %archived.display(), "archived previous event log");
                }
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_error(parent))?;
        }

        let file = fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_error(&path))?;

        Ok(Self {
            path,
            file,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appended(&self) -> usize {
        self.appended
    }

    /// One record per call, written as a single buffer so a crash leaves at most
    /// a truncated final line.
    pub async fn append(&mut self, event: &GradingEvent) -> Result<(), EventLogError> {
        let mut line = serde_json::to_vec(event).map_err(EventLogError::Encode)?;
        line.push(b'\n');
        self.file.write_all(&line).await.map_err(io_error(&self.path))?;
        self.file.flush().await.map_err(io_error(&self.path))?;
        self.appended += 1;
        Ok(())
    }
}

pub async fn read_events(path: &Path) -> Result<Vec<GradingEvent>, EventLogError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(EventLogError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(io_error(path)(err)),
    };

    let mut lines: Vec<&str> = raw.split('\n').collect();
    // everything after the last newline is an interrupted write
    if let Some(fragment) = lines.pop() {
        if !fragment.trim().is_empty() {
            warn!(
                path = %path.display(),
                bytes = fragment.len(),
                "ignoring unterminated trailing record in event log"
            );
        }
    }

    let mut events = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(line).map_err(|source| EventLogError::Malformed {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        events.push(event);
    }
    Ok(events)
}
