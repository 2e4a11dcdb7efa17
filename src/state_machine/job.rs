use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of media a run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Image,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Target web tool a worker agent automates (e.g. "flow", "grok").
///
/// Kept as an open name so new sites only need config, not code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(String);

impl Platform {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key used by config lookups, e.g. `grok:video`.
    pub fn target_key(&self, media: MediaKind) -> String {
        format!("{}:{media}", self.0)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new("flow")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a job ended without success. Carried through logs and into the
/// result's error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Ordinary agent-reported failure.
    Transient(String),
    /// Content-policy rejection.
    Censorship(String),
    /// Per-job scheduler timeout or watchdog deadline.
    Timeout(String),
    /// Generated fine but delivery to the project backend failed.
    Upload(String),
    /// Operator skipped the item.
    Skipped,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient(msg) => write!(f, "{msg}"),
            FailureKind::Censorship(msg) => write!(f, "Censored: {msg}"),
            FailureKind::Timeout(msg) => write!(f, "Timeout: {msg}"),
            FailureKind::Upload(msg) => write!(f, "Upload failed: {msg}"),
            FailureKind::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Configuration for the in-place retry loop of a single item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts allowed per item before it is recorded as failed.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// One queue entry as supplied by a caller, before positions are assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_key: Option<String>,
    /// Excluded from censorship rewrites.
    #[serde(default)]
    pub special: bool,
}

impl JobSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// One unit of work in a run's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Position in the current run's queue.
    pub sequence_index: usize,
    /// Position in the first queue this job appeared in; never renumbered.
    pub original_index: usize,
    pub prompt: String,
    /// Captured on the first rewrite, fixed afterwards.
    pub original_prompt: Option<String>,
    pub rewrite_count: u32,
    pub media_ref: Option<String>,
    pub segment_key: Option<String>,
    pub is_special_category: bool,
}

impl Job {
    pub fn from_spec(position: usize, spec: JobSpec) -> Self {
        Self {
            sequence_index: position,
            original_index: position,
            prompt: spec.prompt,
            original_prompt: None,
            rewrite_count: 0,
            media_ref: spec.media_ref,
            segment_key: spec.segment_key,
            is_special_category: spec.special,
        }
    }

    /// The text every rewrite starts from, so attempts never compound.
    pub fn rewrite_source(&self) -> &str {
        self.original_prompt.as_deref().unwrap_or(&self.prompt)
    }

    pub fn apply_rewrite(&mut self, revised: String) {
        if self.original_prompt.is_none() {
            self.original_prompt = Some(self.prompt.clone());
        }
        self.prompt = revised;
        self.rewrite_count += 1;
    }

    /// Undo all rewrites, restoring the prompt the job started with.
    pub fn reset_rewrites(&mut self) {
        if let Some(original) = self.original_prompt.take() {
            self.prompt = original;
        }
        self.rewrite_count = 0;
    }

    /// Short human-readable label for progress output.
    pub fn summary(&self, max_chars: usize) -> String {
        let mut text: String = self.prompt.chars().take(max_chars).collect();
        if self.prompt.chars().count() > max_chars {
            text.push('…');
        }
        text
    }
}

/// Terminal outcome for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub index: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn success(index: usize, segment_key: Option<String>, media_ref: Option<String>) -> Self {
        Self {
            index,
            success: true,
            error: None,
            segment_key,
            media_ref,
            finished_at: Utc::now(),
        }
    }

    pub fn failure(index: usize, kind: &FailureKind, segment_key: Option<String>) -> Self {
        Self {
            index,
            success: false,
            error: Some(kind.to_string()),
            segment_key,
            media_ref: None,
            finished_at: Utc::now(),
        }
    }
}
