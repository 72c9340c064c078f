//! Corruption scanning for JSON state files

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tracing::{debug, warn};

use super::checksum::{sha256_bytes, ChecksumRegistry};

/// Files shorter than this are reported as truncated
const MIN_DOCUMENT_BYTES: usize = 10;

/// Severity of a single finding, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Low,
    Major,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionKind {
    /// Invalid JSON syntax
    Syntax,
    /// Missing, unreadable or wrongly shaped document
    Structure,
    /// Content differs from the last recorded write
    Checksum,
    /// Empty or truncated content
    Partial,
    /// NUL bytes or invalid UTF-8
    Encoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionIssue {
    pub kind: CorruptionKind,
    pub severity: IssueSeverity,
    pub description: String,
    pub details: Option<String>,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub path: PathBuf,
    pub is_corrupted: bool,
    pub issues: Vec<CorruptionIssue>,
    pub checksum: Option<String>,
    pub size: u64,
    pub scan_duration_ms: u64,
}

impl CorruptionReport {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            is_corrupted: false,
            issues: Vec::new(),
            checksum: None,
            size: 0,
            scan_duration_ms: 0,
        }
    }

    fn add(
        &mut self,
        kind: CorruptionKind,
        severity: IssueSeverity,
        description: impl Into<String>,
        details: Option<String>,
        suggestion: Option<&str>,
    ) {
        if severity >= IssueSeverity::Major {
            self.is_corrupted = true;
        }
        self.issues.push(CorruptionIssue {
            kind,
            severity,
            description: description.into(),
            details,
            suggestion: suggestion.map(str::to_string),
        });
    }

    /// Number of issues with exactly `severity`
    pub fn count(&self, severity: IssueSeverity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    pub fn worst(&self) -> Option<IssueSeverity> {
        self.issues.iter().map(|i| i.severity).max()
    }
}

/// Anything that can inspect a state file for corruption
#[async_trait]
pub trait CorruptionScanner: Send + Sync {
    async fn scan_file(&self, path: &Path) -> CorruptionReport;
}

/// Default scanner for JSON state documents
#[derive(Clone, Default)]
pub struct CorruptionDetector {
    checksums: Option<Arc<ChecksumRegistry>>,
}

impl CorruptionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare scanned files against checksums recorded by the atomic writer
    pub fn with_checksums(mut self, registry: Arc<ChecksumRegistry>) -> Self {
        self.checksums = Some(registry);
        self
    }

    /// Scan every `*.json` file below `dir`
    pub async fn scan_directory(&self, dir: impl AsRef<Path>) -> std::io::Result<Vec<CorruptionReport>> {
        let mut pending = vec![dir.as_ref().to_path_buf()];
        let mut files = Vec::new();

        while let Some(current) = pending.pop() {
            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    let hidden = entry.file_name().to_string_lossy().starts_with('.');
                    if !hidden {
                        pending.push(path);
                    }
                } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    files.push(path);
                }
            }
        }

        files.sort();
        let scans = files.iter().map(|path| self.scan_file(path));
        Ok(futures::future::join_all(scans).await)
    }

    fn inspect(&self, path: &Path, data: &[u8], report: &mut CorruptionReport) {
        report.checksum = Some(sha256_bytes(data));

        if data.is_empty() {
            report.add(
                CorruptionKind::Partial,
                IssueSeverity::Critical,
                "File is empty",
                None,
                Some("Restore from backup or reinitialize"),
            );
            return;
        }

        if data.len() < MIN_DOCUMENT_BYTES {
            report.add(
                CorruptionKind::Partial,
                IssueSeverity::Major,
                "File appears truncated",
                Some(format!("Only {} bytes", data.len())),
                Some("Restore from backup"),
            );
        }

        if let Some(position) = data.iter().position(|b| *b == 0) {
            report.add(
                CorruptionKind::Encoding,
                IssueSeverity::Major,
                "Null byte found in JSON file",
                Some(format!("Null byte at position {}", position)),
                Some("File may be corrupted or contain binary data"),
            );
        } else if std::str::from_utf8(data).is_err() {
            report.add(
                CorruptionKind::Encoding,
                IssueSeverity::Major,
                "Invalid UTF-8 encoding",
                None,
                Some("File contains invalid UTF-8 sequences"),
            );
        }

        let document: Value = match serde_json::from_slice(data) {
            Ok(value) => value,
            Err(e) => {
                let suggestion = json_fix_hint(&e);
                report.add(
                    CorruptionKind::Syntax,
                    IssueSeverity::Critical,
                    "Invalid JSON syntax",
                    Some(e.to_string()),
                    Some(suggestion),
                );
                return;
            }
        };

        if let Some(expected) = self.checksums.as_ref().and_then(|registry| registry.get(path)) {
            let actual = report.checksum.clone().unwrap_or_default();
            if expected != actual {
                report.add(
                    CorruptionKind::Checksum,
                    IssueSeverity::Major,
                    "Checksum mismatch",
                    Some(format!("Expected {}, got {}", expected, actual)),
                    Some("File may have been modified externally or corrupted"),
                );
            }
        }

        match &document {
            Value::Object(map) if map.is_empty() => report.add(
                CorruptionKind::Structure,
                IssueSeverity::Low,
                "Document is an empty object",
                None,
                None,
            ),
            Value::Array(items) if items.is_empty() => report.add(
                CorruptionKind::Structure,
                IssueSeverity::Low,
                "Document is an empty array",
                None,
                None,
            ),
            Value::Object(_) | Value::Array(_) => {}
            _ => report.add(
                CorruptionKind::Structure,
                IssueSeverity::Major,
                "Top-level value is not an object or array",
                None,
                Some("Restore from backup"),
            ),
        }
    }
}

fn json_fix_hint(err: &serde_json::Error) -> &'static str {
    use serde_json::error::Category;
    match err.classify() {
        Category::Eof => "File ends unexpectedly; check for missing closing braces or brackets",
        Category::Syntax if err.to_string().contains("trailing comma") => {
            "Remove the trailing comma before the closing bracket"
        }
        Category::Syntax => "Fix JSON syntax or restore from backup",
        _ => "Restore from backup",
    }
}

#[async_trait]
impl CorruptionScanner for CorruptionDetector {
    async fn scan_file(&self, path: &Path) -> CorruptionReport {
        let started = Instant::now();
        let mut report = CorruptionReport::new(path);

        match fs::read(path).await {
            Ok(data) => {
                report.size = data.len() as u64;
                self.inspect(path, &data, &mut report);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.add(
                CorruptionKind::Structure,
                IssueSeverity::Critical,
                "File does not exist",
                None,
                Some("Check file path and restore from backup if available"),
            ),
            Err(e) => report.add(
                CorruptionKind::Structure,
                IssueSeverity::Critical,
                "Cannot read file",
                Some(e.to_string()),
                Some("Check file permissions and disk health"),
            ),
        }

        report.scan_duration_ms = started.elapsed().as_millis() as u64;
        if report.is_corrupted {
            warn!(path = %path.display(), issues = report.issues.len(), "Corruption detected");
        } else {
            debug!(path = %path.display(), "File passed corruption scan");
        }
        report
    }
}
