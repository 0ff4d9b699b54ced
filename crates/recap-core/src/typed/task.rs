//! Task trait - 型付き payload と job kind の対応付け
//!
//! # Trait Bounds
//! - `Serialize`: enqueue 時に payload へ変換するため
//! - `DeserializeOwned`: worker 側で payload から復元するため
//! - `Send + Sync + 'static`: handler を Arc に格納して複数 worker で共有するため

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A payload type bound to one job kind.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RenderPdf {
///     meeting_id: String,
/// }
///
/// impl Task for RenderPdf {
///     const KIND: &'static str = "render_pdf";
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;
}

/// Producer contract for kind `"summarize"`: summarize one meeting transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizeMeeting {
    #[serde(rename = "meetingId")]
    pub meeting_id: String,
}

impl SummarizeMeeting {
    pub fn new(meeting_id: impl Into<String>) -> Self {
        Self {
            meeting_id: meeting_id.into(),
        }
    }
}

impl Task for SummarizeMeeting {
    const KIND: &'static str = "summarize";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_payload_uses_camel_case_meeting_id() {
        let payload = serde_json::to_value(SummarizeMeeting::new("m1")).unwrap();
        assert_eq!(payload, serde_json::json!({ "meetingId": "m1" }));

        let back: SummarizeMeeting = serde_json::from_value(payload).unwrap();
        assert_eq!(back.meeting_id, "m1");
    }
}
