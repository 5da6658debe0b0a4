//! Append-only, hash-chained trail of rotation activity.
//!
//! One JSON object per line. Each entry stores `entry_hash`, the SHA-256 of its
//! canonical JSON (sorted keys, `entry_hash` omitted), and `prev_hash`, the
//! `entry_hash` of the line before it. Secret values are never recorded.

use crate::constants;
use crate::core::file_lock::FileLock;
use crate::models::event::RotationStep;
use crate::util::fs as audit_fs;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const TAIL_CHUNK: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub secret_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_hash: Option<String>,
}

/// What happened, before the log stamps and chains it.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    action: String,
    secret_id: String,
    step: Option<String>,
    token: Option<String>,
    error: Option<String>,
    detail: Option<String>,
}

impl AuditEvent {
    pub fn new(action: &str, secret_id: &str) -> Self {
        Self {
            action: action.to_string(),
            secret_id: secret_id.to_string(),
            step: None,
            token: None,
            error: None,
            detail: None,
        }
    }

    pub fn step(mut self, step: RotationStep) -> Self {
        self.step = Some(step.as_str().to_string());
        self
    }

    pub fn token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn failed(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

#[derive(Debug, Default)]
pub struct ChainReport {
    pub total: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    environment: Option<String>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>, environment: Option<String>) -> Self {
        Self {
            path: path.into(),
            environment,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: AuditEvent) -> Result<()> {
        audit_fs::ensure_parent_dir(&self.path)
            .with_context(|| format!("create directory for {}", self.path.display()))?;
        let _lock = FileLock::acquire(&self.path)
            .with_context(|| format!("lock audit log {}", self.path.display()))?;

        let mut entry = AuditEntry {
            timestamp: Utc::now(),
            action: event.action,
            secret_id: event.secret_id,
            step: event.step,
            token: event.token,
            actor: detect_actor(),
            environment: self.environment.clone(),
            result: AuditResult {
                success: event.error.is_none(),
                error: event.error,
                detail: event.detail,
            },
            prev_hash: last_entry_hash(&self.path)?,
            entry_hash: None,
        };
        entry.entry_hash = Some(entry_hash(&entry)?);

        let line = serde_json::to_string(&entry).context("serialize audit entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open audit log {}", self.path.display()))?;
        writeln!(file, "{}", line).context("write audit entry")?;
        audit_fs::set_mode(&self.path, constants::AUDIT_LOG_MODE)
            .context("set audit log permissions")?;
        Ok(())
    }

    /// Entries in order, keeping the last `limit`. Malformed lines are counted, not returned.
    pub fn read(&self, limit: Option<usize>) -> Result<(Vec<AuditEntry>, usize)> {
        let mut entries = Vec::new();
        let mut malformed = 0usize;
        for line in self.lines()? {
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(_) => malformed += 1,
            }
        }
        if let Some(limit) = limit {
            let skip = entries.len().saturating_sub(limit);
            entries.drain(..skip);
        }
        Ok((entries, malformed))
    }

    pub fn verify_chain(&self) -> Result<ChainReport> {
        let mut report = ChainReport::default();
        let mut expected_prev: Option<String> = None;

        for (idx, line) in self.lines()?.into_iter().enumerate() {
            let n = idx + 1;
            report.total += 1;
            let entry = match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    report.errors.push(format!("line {}: malformed entry ({})", n, e));
                    expected_prev = Some(raw_hash(line.as_bytes()));
                    continue;
                }
            };
            if entry.prev_hash != expected_prev {
                report.errors.push(format!(
                    "line {}: prev_hash {:?} does not match preceding entry {:?}",
                    n, entry.prev_hash, expected_prev
                ));
            }
            match (&entry.entry_hash, entry_hash(&entry)) {
                (Some(stored), Ok(computed)) if *stored == computed => {}
                (Some(_), Ok(_)) => {
                    report.errors.push(format!("line {}: entry_hash mismatch (modified?)", n))
                }
                (None, _) => report.errors.push(format!("line {}: entry_hash missing", n)),
                (_, Err(e)) => report.errors.push(format!("line {}: cannot hash: {}", n, e)),
            }
            expected_prev = entry.entry_hash.clone();
        }
        Ok(report)
    }

    fn lines(&self) -> Result<Vec<String>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("open audit log {}", self.path.display()))
            }
        };
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("read audit log line")?;
            if !line.trim().is_empty() {
                out.push(line);
            }
        }
        Ok(out)
    }
}

fn detect_actor() -> String {
    let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
    if let Some(function) = non_empty("AWS_LAMBDA_FUNCTION_NAME") {
        return format!("lambda:{}", function);
    }
    if let Some(user) = non_empty("SUDO_USER") {
        return format!("{}(sudo)", user);
    }
    non_empty("USER").unwrap_or_else(|| "unknown".to_string())
}

fn entry_hash(entry: &AuditEntry) -> Result<String> {
    let mut value = serde_json::to_value(entry).context("serialize audit entry for hashing")?;
    if let Some(map) = value.as_object_mut() {
        map.remove("entry_hash");
    }
    let canonical = serde_json::to_string(&sorted(value)).context("serialize canonical entry")?;
    Ok(raw_hash(canonical.as_bytes()))
}

fn raw_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Rebuild objects with keys in lexical order, recursively.
fn sorted(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.into_iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(pairs.into_iter().map(|(k, v)| (k, sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// `entry_hash` of the final entry, reading backwards from the end of the file.
fn last_entry_hash(path: &Path) -> Result<Option<String>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    let mut pos = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    let mut tail: Vec<u8> = Vec::new();

    loop {
        let step = TAIL_CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))
            .with_context(|| format!("seek {}", path.display()))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)
            .with_context(|| format!("read {}", path.display()))?;
        chunk.extend_from_slice(&tail);
        tail = chunk;

        let end = tail
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map(|i| i + 1)
            .unwrap_or(0);
        let content = &tail[..end];
        let line = match content.iter().rposition(|b| *b == b'\n') {
            Some(nl) => &content[nl + 1..],
            None if pos == 0 => content,
            None => continue,
        };
        if line.is_empty() {
            return Ok(None);
        }
        let hash = serde_json::from_slice::<AuditEntry>(line)
            .ok()
            .and_then(|entry| entry.entry_hash)
            .unwrap_or_else(|| raw_hash(line));
        return Ok(Some(hash));
    }
}
