//! Workflow definitions read from TOML or JSON files.
//!
//! Actions and transitions refer to each other by name. Everything is
//! validated before the first record is stored.
//!
//! ```toml
//! name = "release"
//! start_metadata = { env = "staging" }
//!
//! [[actions]]
//! name = "start"
//! job = "router"
//! start = true
//!
//! [[actions]]
//! name = "build"
//! job = "command"
//! properties = "{'command': 'make', 'args': [env]}"
//! timeout_secs = 600
//!
//! [[transitions]]
//! from = "start"
//! to = "build"
//! condition = "env != 'prod'"
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::interval::Interval;
use crate::job::{JobKind, JobRegistry};
use crate::model::{Action, Transition, TriggerMode, Workflow, WorkflowState};
use crate::store::WorkflowStore;
use crate::workflow::{self, validate_start_action};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default = "default_state")]
    pub state: WorkflowState,
    #[serde(default = "default_metadata")]
    pub start_metadata: Value,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
    #[serde(default)]
    pub transitions: Vec<TransitionDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,
    pub job: JobKind,
    #[serde(default)]
    pub start: bool,
    /// Falls back to the executor's defaults for `job`.
    #[serde(default)]
    pub properties: Option<String>,
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDef {
    pub from: String,
    pub to: String,
    #[serde(default = "default_condition")]
    pub condition: String,
    #[serde(default = "default_condition_name")]
    pub condition_name: String,
    #[serde(default)]
    pub trigger: TriggerMode,
    #[serde(default)]
    pub interval: Option<Interval>,
}

fn default_state() -> WorkflowState {
    WorkflowState::Draft
}

fn default_metadata() -> Value {
    Value::Object(Default::default())
}

fn default_condition() -> String {
    "True".to_string()
}

fn default_condition_name() -> String {
    "Condition".to_string()
}

impl WorkflowDef {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Reads a definition, choosing the format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_toml_str(&contents),
        }
    }

    /// Checks names and the start-action rules without touching a store.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("workflow name must not be empty"));
        }
        if !self.start_metadata.is_object() {
            return Err(EngineError::validation("start metadata must be a JSON object"));
        }

        let mut names = BTreeSet::new();
        for action in &self.actions {
            if !names.insert(action.name.as_str()) {
                return Err(EngineError::validation(format!(
                    "duplicate action `{}`",
                    action.name
                )));
            }
        }
        for t in &self.transitions {
            for end in [&t.from, &t.to] {
                if !names.contains(end.as_str()) {
                    return Err(EngineError::not_found("Action", end));
                }
            }
        }
        Ok(())
    }
}

/// Stores the workflow described by `def` and returns it.
pub fn import(
    store: &mut impl WorkflowStore,
    def: WorkflowDef,
    registry: &JobRegistry,
) -> Result<Workflow> {
    def.validate()?;
    if store.workflows()?.iter().any(|w| w.name == def.name) {
        return Err(EngineError::validation(format!(
            "workflow `{}` already exists",
            def.name
        )));
    }

    let mut workflow = Workflow::new(def.name);
    workflow.state = def.state;
    workflow.start_metadata = def.start_metadata;

    let mut actions: HashMap<String, Action> = HashMap::new();
    let mut ordered = Vec::with_capacity(def.actions.len());
    for a in def.actions {
        let mut action = Action::new(workflow.id, a.name.clone(), a.job);
        action.start = a.start;
        action.timeout_secs = a.timeout_secs;
        action.properties = a
            .properties
            .unwrap_or_else(|| registry.properties_defaults(a.job));
        ordered.push(a.name.clone());
        actions.insert(a.name, action);
    }

    let mut transitions = Vec::with_capacity(def.transitions.len());
    for t in def.transitions {
        let (Some(from), Some(to)) = (actions.get(&t.from), actions.get(&t.to)) else {
            return Err(EngineError::not_found("Action", format!("{} -> {}", t.from, t.to)));
        };
        let mut transition = Transition::new(from.id, to.id);
        transition.condition = t.condition;
        transition.condition_name = t.condition_name;
        transition.trigger = t.trigger;
        if let Some(interval) = t.interval {
            transition.interval = interval;
        }
        transitions.push(transition);
    }

    for action in actions.values() {
        let incoming: Vec<Transition> = transitions
            .iter()
            .filter(|t| t.to == action.id)
            .cloned()
            .collect();
        validate_start_action(action, &incoming)?;
    }

    store.insert_workflow(workflow.clone())?;
    for name in &ordered {
        if let Some(action) = actions.remove(name) {
            workflow::add_action(store, action)?;
        }
    }
    for transition in transitions {
        workflow::add_transition(store, transition)?;
    }
    info!(workflow = %workflow.name, actions = ordered.len(), "workflow imported");
    Ok(workflow)
}
