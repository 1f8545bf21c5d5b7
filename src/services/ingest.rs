use crate::error::IngestError;
use crate::models::{Event, EventRole};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

/// Outcome of one ingest pass.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub events: Vec<Event>,
    /// Records dropped as malformed.
    pub skipped: usize,
    /// Records dropped as already processed (high-water mark or duplicate).
    pub already_seen: usize,
}

/// Turns raw log records into canonical [`Event`]s.
///
/// Tracks a per-source high-water mark and a duplicate set keyed on
/// (message_id, request_id) so that re-delivering the same records is a
/// no-op. Holds no session state; block boundaries are not its business.
#[derive(Debug, Default)]
pub struct LogIngestor {
    high_water: HashMap<String, DateTime<Utc>>,
    seen_ids: HashSet<(String, String)>,
}

impl LogIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a batch of raw records. Malformed records are logged at debug
    /// level and skipped; the pass itself never fails. State commits as a
    /// whole only after the batch is fully parsed.
    pub fn ingest<'a, I>(&mut self, records: I) -> IngestReport
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut report = IngestReport::default();
        let mut new_marks: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut new_ids: HashSet<(String, String)> = HashSet::new();

        for (source, raw) in records {
            let event = match parse_record(raw) {
                Ok(event) => event,
                Err(e) => {
                    log::debug!("Skipping malformed record from {source}: {e}");
                    report.skipped += 1;
                    continue;
                }
            };

            // Only marks committed by previous passes gate the batch; events
            // within one batch may arrive out of order.
            if let Some(mark) = self.high_water.get(source) {
                if event.timestamp <= *mark {
                    report.already_seen += 1;
                    continue;
                }
            }

            if let (Some(m), Some(r)) = (&event.message_id, &event.request_id) {
                let key = (m.clone(), r.clone());
                if self.seen_ids.contains(&key) || !new_ids.insert(key) {
                    report.already_seen += 1;
                    continue;
                }
            }

            let entry = new_marks.entry(source.to_string()).or_insert(event.timestamp);
            if event.timestamp > *entry {
                *entry = event.timestamp;
            }
            report.events.push(event);
        }

        // Commit marks and ids together once the whole batch parsed.
        for (source, mark) in new_marks {
            let entry = self.high_water.entry(source).or_insert(mark);
            if mark > *entry {
                *entry = mark;
            }
        }
        self.seen_ids.extend(new_ids);

        report.events.sort_by_key(|e| e.timestamp);
        report
    }
}

/// Parse one raw record into an [`Event`], failing closed on anything that
/// does not validate. Unknown extra fields are ignored.
pub fn parse_record(raw: &Value) -> Result<Event, IngestError> {
    let obj = raw.as_object().ok_or(IngestError::NotAnObject)?;

    let ts_str = obj
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or(IngestError::MissingTimestamp)?;
    // parse_from_rfc3339 accepts both 'Z' and numeric offsets; everything
    // normalizes to UTC here so downstream ordering is timezone-free.
    let timestamp = DateTime::parse_from_rfc3339(ts_str)
        .map_err(|_| IngestError::BadTimestamp(ts_str.to_string()))?
        .with_timezone(&Utc);

    let role = match obj.get("type").and_then(|v| v.as_str()) {
        Some("user") => EventRole::User,
        Some("assistant") => EventRole::Assistant,
        Some("system") => EventRole::System,
        other => return Err(IngestError::UnknownRole(other.unwrap_or("missing").to_string())),
    };

    let message = obj.get("message").and_then(|v| v.as_object());
    let usage = message.and_then(|m| m.get("usage")).and_then(|v| v.as_object());

    let usage_total: u64 = usage
        .map(|u| {
            [
                "input_tokens",
                "output_tokens",
                "cache_creation_input_tokens",
                "cache_read_input_tokens",
            ]
            .iter()
            .filter_map(|key| u.get(*key).and_then(|v| v.as_u64()))
            .sum()
        })
        .unwrap_or(0);

    if role == EventRole::Assistant && usage_total == 0 {
        return Err(IngestError::MissingUsage);
    }

    let content = message.and_then(|m| m.get("content"));
    let tool_result = role == EventRole::User && is_tool_result(content);

    let size_units = if usage_total > 0 {
        usage_total
    } else {
        content_chars(content)
    };

    let model = message
        .and_then(|m| m.get("model"))
        .or_else(|| obj.get("model"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let message_id = obj
        .get("message_id")
        .and_then(|v| v.as_str())
        .or_else(|| message.and_then(|m| m.get("id")).and_then(|v| v.as_str()))
        .map(|s| s.to_string());
    let request_id = obj
        .get("requestId")
        .or_else(|| obj.get("request_id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(Event {
        timestamp,
        role,
        size_units,
        model,
        tool_result,
        artifact: false,
        message_id,
        request_id,
    })
}

/// Tool results arrive as user entries whose first content item is tagged
/// `tool_result`; they are events but never prompts.
fn is_tool_result(content: Option<&Value>) -> bool {
    content
        .and_then(|c| c.as_array())
        .and_then(|items| items.first())
        .and_then(|first| first.get("type"))
        .and_then(|t| t.as_str())
        .map(|t| t == "tool_result")
        .unwrap_or(false)
}

/// Character count of the message content, as the size signal for entries
/// without token usage.
fn content_chars(content: Option<&Value>) -> u64 {
    match content {
        Some(Value::String(s)) => s.chars().count() as u64,
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .map(|s| s.chars().count() as u64)
            .sum(),
        _ => 0,
    }
}

/// Reads raw records from Claude Code JSONL transcripts on disk.
pub struct FileEventSource {
    data_paths: Vec<PathBuf>,
}

impl FileEventSource {
    pub fn new() -> Result<Self> {
        let data_paths = Self::discover_data_paths()?;

        if data_paths.is_empty() {
            log::warn!("No Claude data directories found; nothing to ingest.");
        } else {
            log::info!("Found Claude data paths: {:?}", data_paths);
        }

        Ok(Self { data_paths })
    }

    pub fn with_paths(data_paths: Vec<PathBuf>) -> Self {
        Self { data_paths }
    }

    /// Discover Claude data directories based on standard locations
    pub fn discover_data_paths() -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();

        let home_dir = dirs::home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;

        // Check environment variables first
        if let Ok(env_paths) = std::env::var("CLAUDE_DATA_PATHS") {
            for path_str in env_paths.split(':') {
                paths.push(PathBuf::from(path_str));
            }
        }
        if let Ok(env_path) = std::env::var("CLAUDE_DATA_PATH") {
            paths.push(PathBuf::from(env_path));
        }

        paths.push(home_dir.join(".claude").join("projects"));
        paths.push(home_dir.join(".config").join("claude").join("projects"));

        Ok(paths
            .into_iter()
            .filter(|path| path.exists() && path.is_dir())
            .collect())
    }

    /// Read every JSONL file under the data paths and return its records as
    /// (source, value) pairs. Unreadable files and unparseable lines are
    /// logged and skipped.
    pub async fn collect_records(&self) -> Result<Vec<(String, Value)>> {
        let mut records = Vec::new();

        for data_path in &self.data_paths {
            log::debug!("Scanning directory: {:?}", data_path);

            for entry in WalkDir::new(data_path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| e.path().extension().map_or(false, |ext| ext == "jsonl"))
            {
                let file_path = entry.path();
                match self.read_jsonl_file(file_path).await {
                    Ok(mut file_records) => records.append(&mut file_records),
                    Err(e) => {
                        log::warn!("Failed to read JSONL file {:?}: {}", file_path, e);
                    }
                }
            }
        }

        log::info!("Collected {} raw records from JSONL files", records.len());
        Ok(records)
    }

    async fn read_jsonl_file(&self, file_path: &Path) -> Result<Vec<(String, Value)>> {
        let content = fs::read_to_string(file_path).await?;
        let source = file_path.to_string_lossy().to_string();
        let mut records = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(value) => records.push((source.clone(), value)),
                Err(e) => {
                    log::debug!(
                        "Skipping invalid JSON line {} in {:?}: {}",
                        line_num + 1,
                        file_path,
                        e
                    );
                }
            }
        }

        Ok(records)
    }
}
