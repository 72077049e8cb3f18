use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    #[default]
    Pending,
    Completed,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// An ordered group of tasks. Completion gates progression to the next one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Milestone {
    pub id: Uuid,
    pub name: String,
    pub ordering: i64,
    pub status: MilestoneStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Milestone {
    pub fn new(name: impl Into<String>, ordering: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            ordering,
            status: MilestoneStatus::default(),
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == MilestoneStatus::Completed
    }
}
