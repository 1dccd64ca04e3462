//! Audit store: the persisted record of everything run in each engagement.
//!
//! Layout under the base directory:
//!
//! ```text
//! engagements/<name>/index.json            executions, newest first
//! engagements/<name>/records/meta_<id>.json
//! engagements/<name>/records/raw_<id>.txt
//! engagements/<name>/records/redacted_<id>.txt
//! engagements/<name>/highlights.json
//! engagements/<name>/recordings.json       + recordings/<file>.json|.cast
//! engagements/<name>/screenshots.json
//! ```
//!
//! Index files are replaced atomically so an interrupted write never leaves
//! a truncated index behind.

use crate::classifier::HighlightSet;
use crate::error::{PersistenceError, StoreResult};
use crate::recorder::Recording;
use crate::redactor;
use crate::storage::{
    CommandExecution, CommandRecord, EngagementStats, EngagementSummary, ExecutionStatus,
    RecordingEntry, ScreenshotEntry,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SearchScope {
    #[default]
    All,
    Command,
    Output,
    Tags,
}

/// Filter for [`AuditStore::query`]. The default returns everything.
#[derive(Debug, Clone, Default)]
pub struct ExecutionQuery {
    pub text: Option<String>,
    pub scope: SearchScope,
    pub limit: Option<usize>,
}

impl ExecutionQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn search(text: impl Into<String>, scope: SearchScope) -> Self {
        Self {
            text: Some(text.into()),
            scope,
            limit: None,
        }
    }
}

/// Everything the engine knows about a finished command.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub engagement: String,
    pub command: String,
    pub raw_output: String,
    pub started_at: DateTime<Utc>,
    pub working_dir: PathBuf,
    pub duration: Duration,
    pub status: ExecutionStatus,
    pub exit_code: Option<u32>,
    pub timed_out: bool,
}

pub struct AuditStore {
    base_dir: PathBuf,
}

pub fn validate_engagement(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidEngagement(name.to_string()))
    }
}

/// Collapse whitespace runs and the spaces around pipes.
pub fn format_command(command: &str) -> String {
    let mut result = String::new();
    let mut chars = command.trim().chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            while chars.peek().is_some_and(|n| n.is_whitespace()) {
                chars.next();
            }
            // If next character is pipe symbol, don't add space
            if chars.peek() != Some(&'|') {
                result.push(' ');
            }
        } else if c == '|' {
            result.push('|');
            while chars.peek().is_some_and(|n| n.is_whitespace()) {
                chars.next();
            }
        } else {
            result.push(c);
        }
    }

    result.trim().to_string()
}

pub fn hash_command(command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format_command(command).as_bytes());
    hex::encode(hasher.finalize())
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> StoreResult<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&content)?)
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> StoreResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PersistenceError::NotFound(path.display().to_string()))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.persist(path).map_err(|e| PersistenceError::Io(e.error))?;
    Ok(())
}

impl AuditStore {
    pub fn open(base_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(base_dir.join("engagements"))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn engagement_dir(&self, engagement: &str) -> StoreResult<PathBuf> {
        validate_engagement(engagement)?;
        Ok(self.base_dir.join("engagements").join(engagement))
    }

    fn records_dir(&self, engagement: &str) -> StoreResult<PathBuf> {
        Ok(self.engagement_dir(engagement)?.join("records"))
    }

    pub fn recordings_dir(&self, engagement: &str) -> StoreResult<PathBuf> {
        let dir = self.engagement_dir(engagement)?.join("recordings");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn index_path(&self, engagement: &str) -> StoreResult<PathBuf> {
        Ok(self.engagement_dir(engagement)?.join("index.json"))
    }

    // ---- executions ----

    /// Redact, persist and index one finished command.
    pub fn append_execution(&self, new: NewExecution) -> StoreResult<CommandExecution> {
        let records_dir = self.records_dir(&new.engagement)?;
        fs::create_dir_all(&records_dir)?;

        let mut index = self.records(&new.engagement)?;
        let id = index.iter().map(|r| r.id).max().unwrap_or(0) + 1;

        let record = CommandRecord {
            id,
            engagement: new.engagement.clone(),
            command_hash: hash_command(&new.command),
            command: new.command,
            timestamp: new.started_at,
            working_dir: new.working_dir,
            status: new.status,
            exit_code: new.exit_code,
            duration_ms: new.duration.as_millis() as u64,
            timed_out: new.timed_out,
            tags: Vec::new(),
        };
        let redacted_output = redactor::redact(&new.raw_output);

        fs::write(records_dir.join(format!("raw_{id}.txt")), &new.raw_output)?;
        fs::write(records_dir.join(format!("redacted_{id}.txt")), &redacted_output)?;
        write_json_atomic(&records_dir.join(format!("meta_{id}.json")), &record)?;

        index.insert(0, record.clone());
        write_json_atomic(&self.index_path(&new.engagement)?, &index)?;
        debug!(engagement = %record.engagement, id, status = record.status.as_str(), "execution logged");

        Ok(CommandExecution {
            record,
            raw_output: new.raw_output,
            redacted_output,
        })
    }

    /// Index rows of an engagement, newest first.
    pub fn records(&self, engagement: &str) -> StoreResult<Vec<CommandRecord>> {
        let mut records: Vec<CommandRecord> = read_json_or_default(&self.index_path(engagement)?)?;
        records.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(records)
    }

    pub fn load_execution(&self, engagement: &str, id: u64) -> StoreResult<CommandExecution> {
        let records_dir = self.records_dir(engagement)?;
        let meta_path = records_dir.join(format!("meta_{id}.json"));
        if !meta_path.exists() {
            return Err(PersistenceError::NotFound(format!("execution {id}")));
        }
        let record: CommandRecord = serde_json::from_reader(fs::File::open(&meta_path)?)?;
        let raw_output = fs::read_to_string(records_dir.join(format!("raw_{id}.txt")))?;
        let redacted_output = fs::read_to_string(records_dir.join(format!("redacted_{id}.txt")))?;
        Ok(CommandExecution {
            record,
            raw_output,
            redacted_output,
        })
    }

    /// Executions of `engagement` matching `query`, most recent first.
    pub fn query(&self, engagement: &str, query: &ExecutionQuery) -> StoreResult<Vec<CommandExecution>> {
        let needle = query
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);

        let mut results = Vec::new();
        for record in self.records(engagement)? {
            if query.limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
            let execution = match self.load_execution(engagement, record.id) {
                Ok(execution) => execution,
                Err(e) => {
                    warn!(engagement, id = record.id, error = %e, "skipping unreadable record");
                    continue;
                }
            };
            let keep = match &needle {
                None => true,
                Some(needle) => {
                    let in_command = || execution.record.command.to_lowercase().contains(needle);
                    let in_output = || execution.redacted_output.to_lowercase().contains(needle);
                    let in_tags = || execution.record.tags.join(",").to_lowercase().contains(needle);
                    match query.scope {
                        SearchScope::Command => in_command(),
                        SearchScope::Output => in_output(),
                        SearchScope::Tags => in_tags(),
                        SearchScope::All => in_command() || in_output() || in_tags(),
                    }
                }
            };
            if keep {
                results.push(execution);
            }
        }
        Ok(results)
    }

    /// Replace the tags of the most recent record. Returns the updated record,
    /// or `None` when the engagement has no commands yet.
    pub fn tag_last(&self, engagement: &str, tags: &[String]) -> StoreResult<Option<CommandRecord>> {
        let mut index = self.records(engagement)?;
        let Some(latest) = index.first_mut() else {
            return Ok(None);
        };
        latest.tags = tags
            .iter()
            .flat_map(|t| t.split(','))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let updated = latest.clone();

        let meta_path = self
            .records_dir(engagement)?
            .join(format!("meta_{}.json", updated.id));
        write_json_atomic(&meta_path, &updated)?;
        write_json_atomic(&self.index_path(engagement)?, &index)?;
        Ok(Some(updated))
    }

    pub fn stats(&self, engagement: &str) -> StoreResult<EngagementStats> {
        let records = self.records(engagement)?;
        let total = records.len();
        let succeeded = records
            .iter()
            .filter(|r| r.status == ExecutionStatus::Success)
            .count();
        let average_ms = if total == 0 {
            0.0
        } else {
            records.iter().map(|r| r.duration_ms as f64).sum::<f64>() / total as f64
        };
        Ok(EngagementStats {
            total,
            succeeded,
            average_ms,
            last: records.into_iter().next(),
        })
    }

    /// All engagements with stored data, most recently active first.
    pub fn engagements(&self) -> StoreResult<Vec<EngagementSummary>> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(self.base_dir.join("engagements"))? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if validate_engagement(&name).is_err() {
                continue;
            }
            let records = match self.records(&name) {
                Ok(records) => records,
                Err(e) => {
                    warn!(engagement = %name, error = %e, "skipping engagement with unreadable index");
                    continue;
                }
            };
            summaries.push(EngagementSummary {
                command_count: records.len(),
                last_activity: records.iter().map(|r| r.timestamp).max(),
                name,
            });
        }
        summaries.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(summaries)
    }

    /// Delete everything stored for `engagement`. Returns the number of
    /// execution records removed.
    pub fn clear_engagement(&self, engagement: &str) -> StoreResult<usize> {
        let dir = self.engagement_dir(engagement)?;
        if !dir.exists() {
            return Ok(0);
        }
        let removed = self.records(engagement)?.len();
        fs::remove_dir_all(&dir)?;
        info!(engagement, removed, "engagement cleared");
        Ok(removed)
    }

    // ---- highlights ----

    fn highlights_path(&self, engagement: &str) -> StoreResult<PathBuf> {
        Ok(self.engagement_dir(engagement)?.join("highlights.json"))
    }

    pub fn load_highlights(&self, engagement: &str) -> StoreResult<HighlightSet> {
        read_json_or_default(&self.highlights_path(engagement)?)
    }

    /// Union `highlights` into the stored set; existing entries are kept.
    pub fn save_highlights(&self, engagement: &str, highlights: &HighlightSet) -> StoreResult<usize> {
        if highlights.is_empty() {
            return Ok(0);
        }
        let path = self.highlights_path(engagement)?;
        let mut stored: HighlightSet = read_json_or_default(&path)?;
        let added = stored.merge(highlights);
        if added > 0 {
            write_json_atomic(&path, &stored)?;
        }
        Ok(added)
    }

    // ---- recordings ----

    fn recordings_index_path(&self, engagement: &str) -> StoreResult<PathBuf> {
        Ok(self.engagement_dir(engagement)?.join("recordings.json"))
    }

    /// Write a stopped recording to disk and index it. The asciicast export
    /// is best effort: a failure there is logged and the entry has no cast path.
    pub fn save_recording(&self, recording: &Recording, export_cast: bool) -> StoreResult<RecordingEntry> {
        let engagement = recording.engagement.as_str();
        let dir = self.recordings_dir(engagement)?;
        let stem = format!(
            "recording_{}",
            recording.started_at.with_timezone(&chrono::Local).format("%Y%m%d_%H%M%S")
        );
        let path = unique_path(&dir, &stem, "json");
        write_json_atomic(&path, recording)?;

        let cast_path = if export_cast {
            let cast = path.with_extension("cast");
            match recording.write_asciicast_file(&cast) {
                Ok(()) => Some(cast),
                Err(e) => {
                    warn!(path = %cast.display(), error = %e, "asciicast export failed");
                    None
                }
            }
        } else {
            None
        };

        let index_path = self.recordings_index_path(engagement)?;
        let mut index: Vec<RecordingEntry> = read_json_or_default(&index_path)?;
        let entry = RecordingEntry {
            id: index.iter().map(|e| e.id).max().unwrap_or(0) + 1,
            engagement: engagement.to_string(),
            path,
            cast_path,
            duration_secs: recording.duration_secs,
            timestamp: Utc::now(),
        };
        index.push(entry.clone());
        write_json_atomic(&index_path, &index)?;
        info!(engagement, id = entry.id, path = %entry.path.display(), "recording saved");
        Ok(entry)
    }

    /// Recordings of an engagement, newest first.
    pub fn recordings(&self, engagement: &str) -> StoreResult<Vec<RecordingEntry>> {
        let mut index: Vec<RecordingEntry> =
            read_json_or_default(&self.recordings_index_path(engagement)?)?;
        index.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(index)
    }

    pub fn recording_entry(&self, engagement: &str, id: u64) -> StoreResult<RecordingEntry> {
        self.recordings(engagement)?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| PersistenceError::NotFound(format!("recording {id}")))
    }

    pub fn load_recording(&self, engagement: &str, id: u64) -> StoreResult<Recording> {
        let entry = self.recording_entry(engagement, id)?;
        let content = fs::read_to_string(&entry.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    // ---- screenshots ----

    fn screenshots_path(&self, engagement: &str) -> StoreResult<PathBuf> {
        Ok(self.engagement_dir(engagement)?.join("screenshots.json"))
    }

    pub fn add_screenshot(
        &self,
        engagement: &str,
        path: PathBuf,
        command_id: Option<u64>,
        description: &str,
    ) -> StoreResult<ScreenshotEntry> {
        let index_path = self.screenshots_path(engagement)?;
        let mut index: Vec<ScreenshotEntry> = read_json_or_default(&index_path)?;
        let entry = ScreenshotEntry {
            id: index.iter().map(|e| e.id).max().unwrap_or(0) + 1,
            engagement: engagement.to_string(),
            command_id,
            path,
            description: description.to_string(),
            timestamp: Utc::now(),
        };
        index.push(entry.clone());
        write_json_atomic(&index_path, &index)?;
        Ok(entry)
    }

    pub fn screenshots(&self, engagement: &str) -> StoreResult<Vec<ScreenshotEntry>> {
        read_json_or_default(&self.screenshots_path(engagement)?)
    }
}

fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.{ext}"));
    if !first.exists() {
        return first;
    }
    (2..)
        .map(|n| dir.join(format!("{stem}_{n}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}
