//! Records the engine operates on: workflows, actions, transitions,
//! instances and workitems.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::interval::Interval;
use crate::job::{JobKind, JobValues};

pub type WorkflowId = Uuid;
pub type ActionId = Uuid;
pub type TransitionId = Uuid;
pub type InstanceId = Uuid;
pub type WorkitemId = Uuid;

/// First eight characters of an id, used in display names.
pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Draft,
    Published,
    Deprecated,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Draft => write!(f, "draft"),
            WorkflowState::Published => write!(f, "published"),
            WorkflowState::Deprecated => write!(f, "deprecated"),
        }
    }
}

/// A reusable template graph of actions and transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub state: WorkflowState,
    /// Payload used when a start is requested without one.
    pub start_metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: WorkflowState::Draft,
            start_metadata: json!({}),
            created_at: Utc::now(),
        }
    }
}

/// A node of the workflow graph, run by the executor of its job kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub workflow: WorkflowId,
    pub name: String,
    pub job_kind: JobKind,
    /// Expression evaluated into the `this_job` metadata of each workitem.
    pub properties: String,
    pub start: bool,
    /// Seconds a workitem may stay running past its scheduled run; 0 disables it.
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl Action {
    pub fn new(workflow: WorkflowId, name: impl Into<String>, job_kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow,
            name: name.into(),
            job_kind,
            properties: "{}".to_string(),
            start: false,
            timeout_secs: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Auto,
    Time,
}

/// A conditional, optionally time-delayed edge between two actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub from: ActionId,
    pub to: ActionId,
    pub condition: String,
    pub condition_name: String,
    pub trigger: TriggerMode,
    pub interval: Interval,
}

impl Transition {
    pub fn new(from: ActionId, to: ActionId) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            condition: "True".to_string(),
            condition_name: "Condition".to_string(),
            trigger: TriggerMode::Auto,
            interval: Interval::new(1, crate::interval::IntervalUnit::Days),
        }
    }

    pub fn display_name(&self) -> String {
        match self.trigger {
            TriggerMode::Auto => "Automatic transition".to_string(),
            TriggerMode::Time => format!(
                "After {} {} if {}",
                self.interval.count,
                self.interval.unit.label(),
                self.condition_name
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Done,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Running => write!(f, "running"),
            InstanceState::Done => write!(f, "done"),
        }
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub workflow: WorkflowId,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(workflow: WorkflowId, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow,
            state: InstanceState::Running,
            created_at,
        }
    }

    pub fn display_name(&self, workflow_name: &str) -> String {
        format!(
            "{} - {} - INST{}",
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            workflow_name,
            short_id(&self.id)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkitemState {
    Todo,
    Running,
    Cancelled,
    Exception,
    Done,
}

impl WorkitemState {
    /// `cancelled`, `exception` and `done` are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkitemState::Cancelled | WorkitemState::Exception | WorkitemState::Done
        )
    }
}

impl fmt::Display for WorkitemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkitemState::Todo => write!(f, "todo"),
            WorkitemState::Running => write!(f, "running"),
            WorkitemState::Cancelled => write!(f, "cancelled"),
            WorkitemState::Exception => write!(f, "exception"),
            WorkitemState::Done => write!(f, "done"),
        }
    }
}

/// One execution of a single action within an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workitem {
    pub id: WorkitemId,
    pub action: ActionId,
    pub instance: InstanceId,
    pub workflow: WorkflowId,
    pub job_kind: JobKind,
    pub runner_host: Option<String>,
    pub trigger: TriggerMode,
    pub interval: Interval,
    pub scheduled_run: DateTime<Utc>,
    pub job_metadata: Value,
    pub run: bool,
    pub triggered: bool,
    pub timeout: bool,
    pub pid: u32,
    pub completed: BTreeSet<TransitionId>,
    pub state: WorkitemState,
    pub error_msg: String,
    pub created_at: DateTime<Utc>,
}

impl Workitem {
    /// Snapshot handed to a job executor.
    pub fn job_values(&self) -> JobValues {
        JobValues {
            job_metadata: self.job_metadata.clone(),
            scheduled_run: self.scheduled_run,
            run: self.run,
            triggered: self.triggered,
            timeout: self.timeout,
            pid: self.pid,
            state: self.state,
            error_msg: self.error_msg.clone(),
        }
    }

    /// Read-only view exposed as `workitem` to transition conditions.
    pub fn expression_view(&self) -> Value {
        json!({
            "id": self.id.to_string(),
            "job_kind": self.job_kind.to_string(),
            "state": self.state.to_string(),
            "run": self.run,
            "triggered": self.triggered,
            "timeout": self.timeout,
            "pid": self.pid,
            "scheduled_run": self.scheduled_run.to_rfc3339(),
            "error_msg": self.error_msg,
            "runner_host": self.runner_host,
        })
    }

    pub fn display_name(&self, instance_name: &str, action_name: &str) -> String {
        format!("{instance_name} - {} - {action_name}", self.job_kind)
    }
}
