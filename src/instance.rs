//! Starting workflows and closing finished instances.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::model::{
    Instance, InstanceId, InstanceState, TriggerMode, WorkflowId, WorkflowState, Workitem,
    WorkitemState,
};
use crate::store::{InstanceStore, Store, WorkitemFilter, WorkitemStore};
use crate::workflow;
use crate::workitem::{self, NewWorkitem};

/// Parameters of a workflow start.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// JSON object seeding the metadata chain; the workflow's
    /// `start_metadata` is used when absent.
    pub payload: Option<String>,
    /// Logs the seeded metadata of the start workitem.
    pub debug: bool,
    /// Host that should execute the workitems of this instance.
    pub runner_host: Option<String>,
}

fn parse_payload(payload: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| EngineError::validation(format!("input parameters are wrong: {e}")))?;
    if !value.is_object() {
        return Err(EngineError::validation("input parameters must be a JSON object"));
    }
    Ok(value)
}

/// Creates an instance of a published workflow and its start workitem.
///
/// Nothing is stored unless every validation passes.
pub fn run_workflow(
    store: &mut impl Store,
    workflow_id: WorkflowId,
    request: StartRequest,
    now: DateTime<Utc>,
) -> Result<(Instance, Workitem)> {
    let wf = store.workflow(workflow_id)?;
    let payload = match &request.payload {
        Some(raw) => parse_payload(raw)?,
        None if wf.start_metadata.is_object() => wf.start_metadata.clone(),
        None => return Err(EngineError::validation("start metadata must be a JSON object")),
    };

    let start = workflow::start_action(&*store, wf.id)?;
    if wf.state != WorkflowState::Published {
        return Err(EngineError::validation(format!(
            "workflow `{}` is not in published state, publish it before running",
            wf.name
        )));
    }

    let instance = Instance::new(wf.id, now);
    let start_item = workitem::create(
        &*store,
        NewWorkitem {
            action: Some(start.id),
            instance: instance.id,
            workflow: wf.id,
            runner_host: request.runner_host,
            trigger: TriggerMode::Auto,
            interval: Default::default(),
            job_metadata: payload,
        },
        now,
    )?;

    info!(workflow = %wf.name, instance = %instance.id, action = %start.name, "workflow started");
    if request.debug {
        info!(metadata = %start_item.job_metadata, "start workitem metadata");
    }

    store.insert_instance(instance.clone())?;
    store.insert_workitem(start_item.clone())?;
    Ok((instance, start_item))
}

/// An instance is complete once every workitem it owns is `done` and has
/// fired all of its transitions.
pub fn is_complete(workitems: &[Workitem]) -> bool {
    workitems
        .iter()
        .all(|w| w.state == WorkitemState::Done && w.triggered)
}

/// Marks `instance` done if all of its workitems are. Returns whether it closed.
pub fn close_if_complete(store: &mut impl Store, instance_id: InstanceId) -> Result<bool> {
    let mut instance = store.instance(instance_id)?;
    if instance.state == InstanceState::Done {
        return Ok(false);
    }
    let workitems = store.search_workitems(&WorkitemFilter::new().instance(instance.id))?;
    if !is_complete(&workitems) {
        debug!(instance = %instance.id, "instance still has open workitems");
        return Ok(false);
    }
    instance.state = InstanceState::Done;
    store.update_instance(&instance)?;
    info!(instance = %instance.id, workitems = workitems.len(), "instance done");
    Ok(true)
}
