use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// External model backend a job is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Openai,
    Gemini,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Gemini => "gemini",
        }
    }

    pub fn parse(raw: &str) -> Option<Provider> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Provider::Openai),
            "gemini" => Some(Provider::Gemini),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one generation/edit job.
///
/// The variants carry their own payload, so a job can never hold both a
/// result and an error, or a terminal state with neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Succeeded { image_url: String },
    Failed { error: String },
}

impl JobState {
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }
}

/// One generation or edit request and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub prompt: String,
    pub provider: Provider,
    pub created_at: DateTime<Utc>,
    pub source_attachments: Vec<String>,
    pub is_edit: bool,
    pub state: JobState,
}

impl Job {
    pub fn new(
        prompt: impl Into<String>,
        provider: Provider,
        source_attachments: Vec<String>,
    ) -> Self {
        let is_edit = !source_attachments.is_empty();
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            provider,
            created_at: Utc::now(),
            source_attachments,
            is_edit,
            state: JobState::Pending,
        }
    }

    pub fn image_url(&self) -> Option<&str> {
        match &self.state {
            JobState::Succeeded { image_url } => Some(image_url),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// Seconds since submission, for rendering pending entries.
    pub fn elapsed_seconds(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds().max(0)
    }
}

/// Ordered collection of jobs, newest first.
///
/// Settlement targets a job by id rather than position, so concurrent
/// submissions that resolve out of order reconcile independently.
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    jobs: Vec<Job>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the head; the newest submission is always first.
    pub fn insert(&mut self, job: Job) {
        self.jobs.insert(0, job);
    }

    /// Transition a pending job to `Succeeded`. Returns false when the id is
    /// unknown or the job already settled.
    pub fn resolve(&mut self, id: &str, image_url: impl Into<String>) -> bool {
        self.settle(
            id,
            JobState::Succeeded {
                image_url: image_url.into(),
            },
        )
    }

    /// Transition a pending job to `Failed`. Returns false when the id is
    /// unknown or the job already settled.
    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> bool {
        self.settle(
            id,
            JobState::Failed {
                error: error.into(),
            },
        )
    }

    fn settle(&mut self, id: &str, state: JobState) -> bool {
        let Some(job) = self.jobs.iter_mut().find(|job| job.id == id) else {
            return false;
        };
        if !job.state.is_pending() {
            return false;
        }
        job.state = state;
        true
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }
}
