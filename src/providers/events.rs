//! Event shapes recognized from an agent provider's event subscription (§6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Idle,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCall {
    GitCommit { message: String, output: String },
    Bash { command: String, output: String },
    WriteFile { path: String },
    EditFile { path: String },
}

/// One event from an agent provider's subscription. Terminal types recognized
/// are `SessionIdle` and `SessionError`; `FileEdited`/`MessageUpdated` drive
/// file tracking; `ToolCall` drives git-commit and file-write extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    SessionIdle {
        session_id: String,
    },
    SessionStatus {
        session_id: String,
        status: EventStatus,
    },
    SessionError {
        session_id: String,
        message: String,
    },
    FileEdited {
        session_id: String,
        path: String,
    },
    MessageUpdated {
        session_id: String,
        diff_files: Vec<String>,
    },
    ToolCall {
        session_id: String,
        call: ToolCall,
    },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::SessionIdle { .. }
                | AgentEvent::SessionStatus { status: EventStatus::Idle, .. }
                | AgentEvent::SessionError { .. }
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, AgentEvent::SessionError { .. })
    }
}
