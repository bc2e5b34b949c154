use serde::{Deserialize, Serialize};

/// Monotonically increasing token distinguishing successive attempts for the
/// same mode. Events carrying an older generation than the mode's current one
/// are stale and must be dropped.
pub type Generation = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

/// Externally visible state of one mode, as reported by a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeReport {
    pub mode: String,
    pub generation: Generation,
    pub status: TaskStatus,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Join completed mode outputs into one markdown document, one `##` section
/// per mode. Modes without output are skipped.
pub fn combined_report(reports: &[ModeReport]) -> String {
    let sections: Vec<String> = reports
        .iter()
        .filter(|r| !r.text.trim().is_empty())
        .map(|r| format!("## {}\n{}", r.mode, r.text.trim()))
        .collect();
    sections.join("\n\n")
}
