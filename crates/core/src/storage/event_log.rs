use crate::events::{Event, EventSink};
use crate::types::ExecutionId;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Buffered events per execution before a flush is forced
const FLUSH_THRESHOLD: usize = 100;

/// Event log persisted as gzip-compressed JSON Lines, one file per execution per day
pub struct JsonlEventLog {
    base_path: PathBuf,
    buffer: RwLock<HashMap<ExecutionId, Vec<Event>>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(HashMap::new()),
        })
    }

    /// Format: events/YYYY/MM/DD/<execution_id>.jsonl.gz
    fn event_log_path(&self, execution_id: &ExecutionId, date: NaiveDate) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", execution_id))
    }

    /// Write buffered events of one execution to disk
    pub async fn flush(&self, execution_id: &ExecutionId) -> Result<()> {
        let events = {
            let mut buffer = self.buffer.write().await;
            match buffer.remove(execution_id) {
                Some(events) if !events.is_empty() => events,
                _ => return Ok(()),
            }
        };

        let mut events_by_date: HashMap<NaiveDate, Vec<Event>> = HashMap::new();
        for event in events {
            events_by_date
                .entry(event.timestamp.date_naive())
                .or_default()
                .push(event);
        }

        for (date, events) in events_by_date {
            let path = self.event_log_path(execution_id, date);

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            let compressed = encode_jsonl_gz(&all_events)?;
            tokio::fs::write(&path, compressed)
                .await
                .context("Failed to write event log file")?;
        }

        Ok(())
    }

    /// Flush every execution with buffered events
    pub async fn flush_all(&self) -> Result<()> {
        let ids: Vec<ExecutionId> = self.buffer.read().await.keys().copied().collect();
        for id in ids {
            self.flush(&id).await?;
        }
        Ok(())
    }

    /// All events of one execution, oldest first
    pub async fn get_execution_events(&self, execution_id: ExecutionId) -> Result<Vec<Event>> {
        self.flush(&execution_id).await?;

        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let filename = format!("{}.jsonl.gz", execution_id);
        let mut all_events = Vec::new();
        for entry in walkdir::WalkDir::new(&events_dir) {
            let entry = entry.context("Failed to walk event log directory")?;
            if entry.file_type().is_file() && entry.file_name().to_string_lossy() == filename {
                all_events.extend(read_jsonl_gz(entry.path())?);
            }
        }

        all_events.sort_by_key(|e| e.timestamp);
        Ok(all_events)
    }
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line).context("Failed to parse event")?);
    }
    Ok(events)
}

fn encode_jsonl_gz(events: &[Event]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }
    encoder.finish().context("Failed to finish compression")
}

#[async_trait::async_trait]
impl EventSink for JsonlEventLog {
    async fn publish(&self, event: Event) -> Result<()> {
        let execution_id = event.execution_id;
        let pending = {
            let mut buffer = self.buffer.write().await;
            let events = buffer.entry(execution_id).or_default();
            events.push(event);
            events.len()
        };

        if pending > FLUSH_THRESHOLD {
            self.flush(&execution_id).await?;
        }
        Ok(())
    }
}

/// Event log kept in memory, mostly for tests and short-lived hosts
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    pub async fn execution_events(&self, execution_id: ExecutionId) -> Vec<Event> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl EventSink for MemoryEventLog {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}
