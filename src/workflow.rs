//! Workflow graph maintenance: lifecycle state, actions and transitions,
//! and the start-action invariant.

use tracing::info;

use crate::error::{EngineError, Result};
use crate::model::{
    Action, ActionId, InstanceState, Transition, Workflow, WorkflowId, WorkflowState,
    WorkitemState,
};
use crate::store::{InstanceFilter, Store, WorkflowStore, WorkitemFilter};

/// Moves a workflow to `state`. Any state may follow any other.
pub fn set_state(
    store: &mut impl WorkflowStore,
    id: WorkflowId,
    state: WorkflowState,
) -> Result<Workflow> {
    let mut workflow = store.workflow(id)?;
    workflow.state = state;
    store.update_workflow(&workflow)?;
    info!(workflow = %workflow.name, %state, "workflow state changed");
    Ok(workflow)
}

/// A start action must have no incoming transitions and must be a router.
pub fn validate_start_action(action: &Action, incoming: &[Transition]) -> Result<()> {
    if !action.start {
        return Ok(());
    }
    if !incoming.is_empty() {
        return Err(EngineError::validation(format!(
            "action `{}` cannot be start since it has arriving transitions",
            action.name
        )));
    }
    if !action.job_kind.is_router() {
        return Err(EngineError::validation(format!(
            "action `{}` cannot be start unless it is a router",
            action.name
        )));
    }
    Ok(())
}

/// Inserts `action`, enforcing the start-action rules.
pub fn add_action(store: &mut impl WorkflowStore, action: Action) -> Result<()> {
    validate_start_action(&action, &[])?;
    store.insert_action(action)
}

/// Updates an existing action, re-checking the start-action rules.
pub fn update_action(store: &mut impl WorkflowStore, action: &Action) -> Result<()> {
    let incoming = store.incoming(action.id)?;
    validate_start_action(action, &incoming)?;
    store.update_action(action)
}

/// Inserts `transition` after checking both ends belong to one workflow and
/// the target does not become a start action with arriving transitions.
pub fn add_transition(store: &mut impl WorkflowStore, transition: Transition) -> Result<()> {
    let from = store.action(transition.from)?;
    let to = store.action(transition.to)?;
    if from.workflow != to.workflow {
        return Err(EngineError::validation(format!(
            "transition `{}` -> `{}` crosses workflows",
            from.name, to.name
        )));
    }
    let mut incoming = store.incoming(to.id)?;
    incoming.push(transition.clone());
    validate_start_action(&to, &incoming)?;
    store.insert_transition(transition)
}

/// The single start action of `workflow`.
pub fn start_action(store: &impl WorkflowStore, workflow: WorkflowId) -> Result<Action> {
    let mut starts: Vec<Action> = store
        .actions(workflow)?
        .into_iter()
        .filter(|a| a.start)
        .collect();
    if starts.len() != 1 {
        return Err(EngineError::validation(
            "you need to have exactly one start action to run",
        ));
    }
    Ok(starts.remove(0))
}

/// Finds an action of `workflow` by name.
pub fn action_by_name(
    store: &impl WorkflowStore,
    workflow: WorkflowId,
    name: &str,
) -> Result<ActionId> {
    store
        .actions(workflow)?
        .into_iter()
        .find(|a| a.name == name)
        .map(|a| a.id)
        .ok_or_else(|| EngineError::not_found("Action", name))
}

/// Looks a workflow up by id or by name.
pub fn find_workflow(store: &impl WorkflowStore, key: &str) -> Result<Workflow> {
    if let Ok(id) = key.parse::<WorkflowId>() {
        return store.workflow(id);
    }
    store
        .workflows()?
        .into_iter()
        .find(|w| w.name == key)
        .ok_or_else(|| EngineError::not_found("Workflow", key))
}

/// Instances and workitems of a workflow that are not done yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenCounts {
    pub instances: usize,
    pub workitems: usize,
}

pub fn open_counts(store: &impl Store, workflow: WorkflowId) -> Result<OpenCounts> {
    let instances = store
        .search_instances(
            &InstanceFilter::new()
                .workflow(workflow)
                .not_in(&[InstanceState::Done]),
        )?
        .len();
    let workitems = store
        .search_workitems(
            &WorkitemFilter::new()
                .workflow(workflow)
                .not_in(&[WorkitemState::Done]),
        )?
        .len();
    Ok(OpenCounts {
        instances,
        workitems,
    })
}
