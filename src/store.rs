//! Repository interfaces for the records the engine reads and writes,
//! plus an in-memory implementation that can be persisted as JSON.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::{
    Action, ActionId, Instance, InstanceId, InstanceState, Transition, TransitionId, Workflow,
    WorkflowId, Workitem, WorkitemId, WorkitemState,
};

/// Workflows and their graph: actions and transitions.
pub trait WorkflowStore {
    fn insert_workflow(&mut self, workflow: Workflow) -> Result<()>;
    fn update_workflow(&mut self, workflow: &Workflow) -> Result<()>;
    fn workflow(&self, id: WorkflowId) -> Result<Workflow>;
    fn workflows(&self) -> Result<Vec<Workflow>>;

    fn insert_action(&mut self, action: Action) -> Result<()>;
    fn update_action(&mut self, action: &Action) -> Result<()>;
    fn action(&self, id: ActionId) -> Result<Action>;
    fn actions(&self, workflow: WorkflowId) -> Result<Vec<Action>>;

    fn insert_transition(&mut self, transition: Transition) -> Result<()>;
    fn transition(&self, id: TransitionId) -> Result<Transition>;
    fn outgoing(&self, action: ActionId) -> Result<Vec<Transition>>;
    fn incoming(&self, action: ActionId) -> Result<Vec<Transition>>;
}

pub trait InstanceStore {
    fn insert_instance(&mut self, instance: Instance) -> Result<()>;
    fn update_instance(&mut self, instance: &Instance) -> Result<()>;
    fn instance(&self, id: InstanceId) -> Result<Instance>;
    fn search_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>>;
}

pub trait WorkitemStore {
    fn insert_workitem(&mut self, workitem: Workitem) -> Result<()>;
    fn update_workitem(&mut self, workitem: &Workitem) -> Result<()>;
    fn workitem(&self, id: WorkitemId) -> Result<Workitem>;
    fn search_workitems(&self, filter: &WorkitemFilter) -> Result<Vec<Workitem>>;
}

/// Everything the manage loop needs.
pub trait Store: WorkflowStore + InstanceStore + WorkitemStore {}

impl<T: WorkflowStore + InstanceStore + WorkitemStore> Store for T {}

/// Search criteria for workitems. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct WorkitemFilter {
    pub states: Option<Vec<WorkitemState>>,
    pub exclude_states: Vec<WorkitemState>,
    pub triggered: Option<bool>,
    pub instance: Option<InstanceId>,
    pub workflow: Option<WorkflowId>,
}

impl WorkitemFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: WorkitemState) -> Self {
        self.states.get_or_insert_with(Vec::new).push(state);
        self
    }

    pub fn not_in(mut self, states: &[WorkitemState]) -> Self {
        self.exclude_states.extend_from_slice(states);
        self
    }

    pub fn triggered(mut self, triggered: bool) -> Self {
        self.triggered = Some(triggered);
        self
    }

    pub fn instance(mut self, instance: InstanceId) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn workflow(mut self, workflow: WorkflowId) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn matches(&self, item: &Workitem) -> bool {
        self.states.as_ref().is_none_or(|s| s.contains(&item.state))
            && !self.exclude_states.contains(&item.state)
            && self.triggered.is_none_or(|t| item.triggered == t)
            && self.instance.is_none_or(|i| item.instance == i)
            && self.workflow.is_none_or(|w| item.workflow == w)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub exclude_states: Vec<InstanceState>,
    pub workflow: Option<WorkflowId>,
}

impl InstanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn not_in(mut self, states: &[InstanceState]) -> Self {
        self.exclude_states.extend_from_slice(states);
        self
    }

    pub fn workflow(mut self, workflow: WorkflowId) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        !self.exclude_states.contains(&instance.state)
            && self.workflow.is_none_or(|w| instance.workflow == w)
    }
}

/// Keeps every record in ordered maps. Serializable so the CLI can keep
/// state between invocations in a single JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    workflows: BTreeMap<WorkflowId, Workflow>,
    actions: BTreeMap<ActionId, Action>,
    transitions: BTreeMap<TransitionId, Transition>,
    instances: BTreeMap<InstanceId, Instance>,
    workitems: BTreeMap<WorkitemId, Workitem>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a store saved with [`MemoryStore::save`]; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Writes the store next to `path` and renames it into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn insert_new<K: Ord + ToString + Copy, V>(
    map: &mut BTreeMap<K, V>,
    kind: &'static str,
    id: K,
    value: V,
) -> Result<()> {
    if map.contains_key(&id) {
        return Err(EngineError::validation(format!("{kind} {} already exists", id.to_string())));
    }
    map.insert(id, value);
    Ok(())
}

fn replace<K: Ord + ToString + Copy, V: Clone>(
    map: &mut BTreeMap<K, V>,
    kind: &'static str,
    id: K,
    value: &V,
) -> Result<()> {
    let slot = map.get_mut(&id).ok_or_else(|| EngineError::not_found(kind, id))?;
    *slot = value.clone();
    Ok(())
}

fn fetch<K: Ord + ToString + Copy, V: Clone>(
    map: &BTreeMap<K, V>,
    kind: &'static str,
    id: K,
) -> Result<V> {
    map.get(&id)
        .cloned()
        .ok_or_else(|| EngineError::not_found(kind, id))
}

impl WorkflowStore for MemoryStore {
    fn insert_workflow(&mut self, workflow: Workflow) -> Result<()> {
        insert_new(&mut self.workflows, "Workflow", workflow.id, workflow)
    }

    fn update_workflow(&mut self, workflow: &Workflow) -> Result<()> {
        replace(&mut self.workflows, "Workflow", workflow.id, workflow)
    }

    fn workflow(&self, id: WorkflowId) -> Result<Workflow> {
        fetch(&self.workflows, "Workflow", id)
    }

    fn workflows(&self) -> Result<Vec<Workflow>> {
        Ok(self.workflows.values().cloned().collect())
    }

    fn insert_action(&mut self, action: Action) -> Result<()> {
        if !self.workflows.contains_key(&action.workflow) {
            return Err(EngineError::not_found("Workflow", action.workflow));
        }
        insert_new(&mut self.actions, "Action", action.id, action)
    }

    fn update_action(&mut self, action: &Action) -> Result<()> {
        replace(&mut self.actions, "Action", action.id, action)
    }

    fn action(&self, id: ActionId) -> Result<Action> {
        fetch(&self.actions, "Action", id)
    }

    fn actions(&self, workflow: WorkflowId) -> Result<Vec<Action>> {
        Ok(self
            .actions
            .values()
            .filter(|a| a.workflow == workflow)
            .cloned()
            .collect())
    }

    fn insert_transition(&mut self, transition: Transition) -> Result<()> {
        for end in [transition.from, transition.to] {
            if !self.actions.contains_key(&end) {
                return Err(EngineError::not_found("Action", end));
            }
        }
        insert_new(&mut self.transitions, "Transition", transition.id, transition)
    }

    fn transition(&self, id: TransitionId) -> Result<Transition> {
        fetch(&self.transitions, "Transition", id)
    }

    fn outgoing(&self, action: ActionId) -> Result<Vec<Transition>> {
        Ok(self
            .transitions
            .values()
            .filter(|t| t.from == action)
            .cloned()
            .collect())
    }

    fn incoming(&self, action: ActionId) -> Result<Vec<Transition>> {
        Ok(self
            .transitions
            .values()
            .filter(|t| t.to == action)
            .cloned()
            .collect())
    }
}

impl InstanceStore for MemoryStore {
    fn insert_instance(&mut self, instance: Instance) -> Result<()> {
        insert_new(&mut self.instances, "Instance", instance.id, instance)
    }

    fn update_instance(&mut self, instance: &Instance) -> Result<()> {
        replace(&mut self.instances, "Instance", instance.id, instance)
    }

    fn instance(&self, id: InstanceId) -> Result<Instance> {
        fetch(&self.instances, "Instance", id)
    }

    fn search_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect())
    }
}

impl WorkitemStore for MemoryStore {
    fn insert_workitem(&mut self, workitem: Workitem) -> Result<()> {
        if !self.instances.contains_key(&workitem.instance) {
            return Err(EngineError::not_found("Instance", workitem.instance));
        }
        insert_new(&mut self.workitems, "Workitem", workitem.id, workitem)
    }

    fn update_workitem(&mut self, workitem: &Workitem) -> Result<()> {
        replace(&mut self.workitems, "Workitem", workitem.id, workitem)
    }

    fn workitem(&self, id: WorkitemId) -> Result<Workitem> {
        fetch(&self.workitems, "Workitem", id)
    }

    fn search_workitems(&self, filter: &WorkitemFilter) -> Result<Vec<Workitem>> {
        Ok(self
            .workitems
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect())
    }
}
