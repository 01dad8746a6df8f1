use crate::error::CrackError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    InProgress,
    Waiting,
    Ready,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Ready => "READY",
            TaskStatus::Error => "ERROR",
        }
    }

    /// Every status except `ERROR` blocks a second task for the same hash.
    pub fn is_active(&self) -> bool {
        !matches!(self, TaskStatus::Error)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Ready | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CrackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "WAITING" => Ok(TaskStatus::Waiting),
            "READY" => Ok(TaskStatus::Ready),
            "ERROR" => Ok(TaskStatus::Error),
            other => Err(CrackError::Store(format!("unknown task status {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub request_id: String,
    pub hash: String,
    pub max_length: u32,
    pub status: TaskStatus,
    pub data: Option<String>,
}

impl Task {
    pub fn new(hash: &str, max_length: u32, status: TaskStatus) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            hash: hash.to_string(),
            max_length,
            status,
            data: None,
        }
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            status: self.status,
            data: self.data.clone(),
        }
    }

    pub fn sub_task(&self, part_number: u32, part_count: u32) -> SubTask {
        SubTask {
            request_id: self.request_id.clone(),
            hash: self.hash.clone(),
            max_length: self.max_length,
            part_number,
            part_count,
        }
    }
}

/// What status queries return to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub status: TaskStatus,
    pub data: Option<String>,
}

/// One partition's assignment, carried only on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub request_id: String,
    pub hash: String,
    pub max_length: u32,
    pub part_number: u32,
    pub part_count: u32,
}

impl SubTask {
    pub fn encode(&self) -> Result<Vec<u8>, CrackError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CrackError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub request_id: String,
    pub word: String,
}

impl TaskResult {
    pub fn encode(&self) -> Result<Vec<u8>, CrackError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CrackError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateOutcome {
    Create,
    Exist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTask {
    pub task: Task,
    pub outcome: CreateOutcome,
}
