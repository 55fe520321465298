//! On-disk history of finished jobs, one JSON file per run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::media::ContainerFormat;
use crate::scheduler::{JobId, JobState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique across scheduler instances, unlike `job`
    pub run_id: Uuid,
    pub job: JobId,
    pub input: PathBuf,
    pub output: PathBuf,
    pub container: ContainerFormat,
    pub state: JobState,
    pub error: Option<String>,
    #[serde(default)]
    pub stream_failures: Vec<String>,
    pub partial_output: Option<PathBuf>,
    pub bytes_written: u64,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Wall time between start and finish, if the job ever ran
    pub fn run_time(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Write `record` as `<dir>/<run_id>.json`
pub fn save_record(record: &JobRecord, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create job state dir: {}", dir.display()))?;
    let path = dir.join(format!("{}.json", record.run_id));
    let json = serde_json::to_string_pretty(record).context("Failed to serialize job record")?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write job record: {}", path.display()))?;
    debug!("Saved job record {}", path.display());
    Ok(path)
}

/// All readable records in `dir`, oldest submission first. A missing dir is empty.
pub fn load_all_records(dir: &Path) -> Result<Vec<JobRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    let entries = std::fs::read_dir(dir).with_context(|| format!("Failed to read job state dir: {}", dir.display()))?;
    for entry in entries {
        let path = entry.context("Failed to read job state entry")?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let parsed = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| serde_json::from_str::<JobRecord>(&content).map_err(anyhow::Error::from));
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping unreadable job record {}: {}", path.display(), e),
        }
    }
    records.sort_by_key(|r| r.submitted_at);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(minutes_ago: i64, state: JobState) -> JobRecord {
        let submitted = Utc::now() - chrono::Duration::minutes(minutes_ago);
        JobRecord {
            run_id: Uuid::new_v4(),
            job: JobId::from_index(0),
            input: PathBuf::from("/media/in.wav"),
            output: PathBuf::from("/media/in_converted.avi"),
            container: ContainerFormat::Avi,
            state,
            error: None,
            stream_failures: Vec::new(),
            partial_output: None,
            bytes_written: 1024,
            submitted_at: submitted,
            started_at: Some(submitted),
            finished_at: Some(submitted + chrono::Duration::seconds(3)),
        }
    }

    #[test]
    fn test_records_come_back_oldest_first() {
        let dir = TempDir::new().unwrap();
        let newer = record(1, JobState::Failed);
        let older = record(10, JobState::Succeeded);
        save_record(&newer, dir.path()).unwrap();
        save_record(&older, dir.path()).unwrap();
        std::fs::write(dir.path().join("junk.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = load_all_records(dir.path()).unwrap();
        assert_eq!(loaded, vec![older, newer]);
        assert_eq!(loaded[0].run_time(), Some(chrono::Duration::seconds(3)));
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(load_all_records(&dir.path().join("absent")).unwrap().is_empty());
    }
}
