//! The `summarize` job: transcript -> summary + action items.
//!
//! Meeting storage and the LLM are external collaborators; here they are an
//! in-memory repository and a deterministic local summarizer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use recap_core::app::JobContext;
use recap_core::domain::QueueError;
use recap_core::typed::{Handler, SummarizeMeeting};
use serde::Serialize;
use tracing::{info, warn};

const MAX_SUMMARY_INPUT: usize = 2000;
const MAX_BULLETS: usize = 8;
const ACTION_PREFIX: &str = "- [ ]";
const ACTION_HINTS: &[&str] = &["todo", "follow up", "action", "assign", "due"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionItem {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeetingSummary {
    pub meeting_id: String,
    pub content: String,
    pub action_items: Vec<ActionItem>,
}

/// Where transcripts come from and summaries go.
#[async_trait]
pub trait MeetingRepository: Send + Sync {
    async fn transcript(&self, meeting_id: &str) -> Result<Option<String>, QueueError>;
    async fn save_summary(&self, summary: MeetingSummary) -> Result<(), QueueError>;
}

#[derive(Default)]
pub struct InMemoryMeetings {
    transcripts: RwLock<HashMap<String, String>>,
    summaries: RwLock<HashMap<String, MeetingSummary>>,
}

impl InMemoryMeetings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meeting_id: impl Into<String>, transcript: impl Into<String>) {
        self.transcripts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(meeting_id.into(), transcript.into());
    }

    pub fn summaries(&self) -> Vec<MeetingSummary> {
        let mut all: Vec<MeetingSummary> = self
            .summaries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.meeting_id.cmp(&b.meeting_id));
        all
    }
}

#[async_trait]
impl MeetingRepository for InMemoryMeetings {
    async fn transcript(&self, meeting_id: &str) -> Result<Option<String>, QueueError> {
        Ok(self
            .transcripts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(meeting_id)
            .cloned())
    }

    async fn save_summary(&self, summary: MeetingSummary) -> Result<(), QueueError> {
        self.summaries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(summary.meeting_id.clone(), summary);
        Ok(())
    }
}

pub struct SummarizeHandler {
    meetings: Arc<dyn MeetingRepository>,

    /// Demo only: fail this many attempts of every job before succeeding.
    fail_first: u32,
}

impl SummarizeHandler {
    pub fn new(meetings: Arc<dyn MeetingRepository>) -> Self {
        Self {
            meetings,
            fail_first: 0,
        }
    }

    pub fn failing_first(mut self, attempts: u32) -> Self {
        self.fail_first = attempts;
        self
    }
}

#[async_trait]
impl Handler<SummarizeMeeting> for SummarizeHandler {
    async fn handle(&self, ctx: &JobContext, task: SummarizeMeeting) -> Result<(), QueueError> {
        if ctx.attempt() <= self.fail_first {
            return Err(QueueError::handler(format!(
                "summarizer unavailable (simulated, attempt {})",
                ctx.attempt()
            )));
        }

        let Some(transcript) = self.meetings.transcript(&task.meeting_id).await? else {
            // deleted meetings are not an error worth retrying
            warn!(meeting_id = %task.meeting_id, "meeting not found; nothing to summarize");
            return Ok(());
        };

        let content = local_summary(&transcript);
        ctx.checkpoint().await?;

        let action_items = extract_action_items(&content);
        info!(meeting_id = %task.meeting_id, action_items = action_items.len(), "summary created");
        self.meetings
            .save_summary(MeetingSummary {
                meeting_id: task.meeting_id,
                content,
                action_items,
            })
            .await
    }
}

/// Deterministic bullet summary with an `Action Items:` section of `- [ ]` lines.
pub fn local_summary(transcript: &str) -> String {
    let clean: String = transcript
        .replace('\r', " ")
        .chars()
        .take(MAX_SUMMARY_INPUT)
        .collect();
    let sentences: Vec<&str> = clean
        .split(['.', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(MAX_BULLETS)
        .collect();

    let mut actions: Vec<String> = sentences
        .iter()
        .filter(|s| looks_like_action(s))
        .map(|s| format!("{ACTION_PREFIX} {s}"))
        .collect();
    if actions.is_empty() {
        if let Some(first) = sentences.first() {
            actions.push(format!("{ACTION_PREFIX} Confirm next steps for: {first}"));
        }
    }

    let mut lines = vec!["Summary:".to_string()];
    lines.extend(sentences.iter().map(|s| format!("- {s}")));
    lines.push(String::new());
    lines.push("Action Items:".to_string());
    lines.extend(actions);
    lines.join("\n")
}

fn looks_like_action(sentence: &str) -> bool {
    let lower = sentence.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    ACTION_HINTS.iter().any(|hint| {
        let hint_words: Vec<&str> = hint.split(' ').collect();
        words.windows(hint_words.len()).any(|w| w == hint_words.as_slice())
    })
}

/// Lines starting with `- [ ]`.
pub fn extract_action_items(summary: &str) -> Vec<ActionItem> {
    summary
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix(ACTION_PREFIX))
        .map(|rest| ActionItem {
            text: rest.trim().to_string(),
        })
        .collect()
}
