use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::Mutex;
use serde_json::Value;

use crucible_types::TraceEvent;

/// Line-delimited JSON sink for trace events. Each append is flushed so a
/// crash never leaves a half-written prefix of earlier events.
pub struct TraceLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl TraceLog {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening trace log {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &TraceEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

pub fn read_trace_log(path: impl AsRef<Path>) -> anyhow::Result<Vec<TraceEvent>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("opening trace log {}", path.display()))?;
    let mut events = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str::<TraceEvent>(&line)
            .with_context(|| format!("{}:{}: malformed trace event", path.display(), idx + 1))?;
        events.push(event);
    }
    Ok(events)
}

pub fn render_trace_event(event: &TraceEvent) -> String {
    let head = format!(
        "{} #{:<4} {:<22}",
        event.timestamp.format("%H:%M:%S%.3f"),
        event.seq,
        event.event_type
    );
    let family = event.event_type.split('.').next().unwrap_or_default();
    let body = match family {
        "directive" => join_fields(event, &["directiveID", "status", "taskCount", "error"]),
        "task" => join_fields(
            event,
            &["taskID", "directiveID", "attempt", "modelID", "terminal", "error"],
        ),
        "experiment" => join_fields(
            event,
            &["experimentID", "roleID", "domain", "winner", "scores", "error"],
        ),
        "variant" => join_fields(
            event,
            &["experimentID", "variantID", "exitCode", "durationMs", "error"],
        ),
        "tool" | "capability" => join_fields(event, &["tool", "capability", "granted", "error"]),
        _ => Value::Object(event.payload.clone()).to_string(),
    };
    if body.is_empty() {
        head.trim_end().to_string()
    } else {
        format!("{head} {body}")
    }
}

fn join_fields(event: &TraceEvent, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| {
            let value = event.payload.get(*key)?;
            let rendered = match value {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(format!("{key}={rendered}"))
        })
        .collect::<Vec<_>>()
        .join(" ")
}
