//! Lifecycle of a single workitem: creation, run, check, timeout.
//!
//! Every step returns a [`WorkitemUpdate`] instead of mutating the record,
//! so the caller applies it and writes the workitem back once.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::expr::{self, Context};
use crate::interval::Interval;
use crate::job::{JobExecutor, JobValues};
use crate::model::{
    Action, ActionId, InstanceId, TriggerMode, WorkflowId, Workitem, WorkitemState,
};
use crate::store::WorkflowStore;

/// Key under which an action's evaluated properties are stored in the metadata.
pub const THIS_JOB: &str = "this_job";

/// Everything needed to create a workitem.
#[derive(Debug, Clone)]
pub struct NewWorkitem {
    pub action: Option<ActionId>,
    pub instance: InstanceId,
    pub workflow: WorkflowId,
    pub runner_host: Option<String>,
    pub trigger: TriggerMode,
    pub interval: Interval,
    /// Metadata of the predecessor, or the start payload.
    pub job_metadata: Value,
}

/// When a workitem created at `created_at` becomes due.
pub fn scheduled_run(
    trigger: TriggerMode,
    interval: Interval,
    created_at: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    match trigger {
        TriggerMode::Auto => Ok(created_at),
        TriggerMode::Time => interval.delta().after(created_at),
    }
}

/// Layers the action's properties over `metadata` under [`THIS_JOB`].
///
/// The properties expression sees every top-level metadata key as a variable.
pub fn merge_properties(action: &Action, mut metadata: Value) -> Result<Value> {
    let Some(map) = metadata.as_object_mut() else {
        return Err(EngineError::validation("job metadata must be a JSON object"));
    };
    let ctx = Context::from_object(&Value::Object(map.clone()));
    let properties = expr::evaluate(&action.properties, &ctx)?;
    if !properties.is_object() {
        return Err(EngineError::validation(format!(
            "properties of action `{}` must evaluate to a mapping",
            action.name
        )));
    }
    map.insert(THIS_JOB.to_string(), properties);
    Ok(metadata)
}

/// Builds a workitem, computing its schedule, initial state and metadata.
/// The workitem is returned, not stored.
pub fn create(
    store: &impl WorkflowStore,
    new: NewWorkitem,
    now: DateTime<Utc>,
) -> Result<Workitem> {
    let action_id = new
        .action
        .ok_or_else(|| EngineError::validation("workitem must contain an action"))?;
    let action = store.action(action_id)?;

    let scheduled_run = scheduled_run(new.trigger, new.interval, now)?;
    let state = if scheduled_run <= now {
        WorkitemState::Running
    } else {
        WorkitemState::Todo
    };
    let job_metadata = merge_properties(&action, new.job_metadata)?;

    let item = Workitem {
        id: Uuid::new_v4(),
        action: action.id,
        instance: new.instance,
        workflow: new.workflow,
        job_kind: action.job_kind,
        runner_host: new.runner_host,
        trigger: new.trigger,
        interval: new.interval,
        scheduled_run,
        job_metadata,
        run: false,
        triggered: false,
        timeout: false,
        pid: 0,
        completed: BTreeSet::new(),
        state,
        error_msg: String::new(),
        created_at: now,
    };
    info!(
        workitem = %item.id,
        action = %action.name,
        %state,
        scheduled_run = %item.scheduled_run,
        "workitem created"
    );
    Ok(item)
}

/// A change to apply to a workitem.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkitemUpdate {
    Unchanged,
    /// A pending workitem became due.
    Promoted,
    /// Values returned by the executor.
    Job(JobValues),
    /// The executor failed; only the error message changes.
    Failed(String),
    /// The workitem ran past its action's timeout.
    TimedOut(String),
}

impl WorkitemUpdate {
    /// Applies the update, returning whether anything changed.
    pub fn apply(self, item: &mut Workitem) -> bool {
        match self {
            WorkitemUpdate::Unchanged => return false,
            WorkitemUpdate::Promoted => item.state = WorkitemState::Running,
            WorkitemUpdate::Job(values) => {
                item.job_metadata = values.job_metadata;
                item.scheduled_run = values.scheduled_run;
                item.run = values.run;
                item.triggered = values.triggered;
                item.timeout = values.timeout;
                item.pid = values.pid;
                item.state = values.state;
                item.error_msg = values.error_msg;
            }
            WorkitemUpdate::Failed(msg) => item.error_msg = msg,
            WorkitemUpdate::TimedOut(msg) => {
                item.timeout = true;
                item.state = WorkitemState::Exception;
                item.error_msg = msg;
            }
        }
        true
    }
}

/// `todo` becomes `running` once the scheduled run has passed.
pub fn promote(item: &Workitem, now: DateTime<Utc>) -> WorkitemUpdate {
    if item.state == WorkitemState::Todo && item.scheduled_run <= now {
        WorkitemUpdate::Promoted
    } else {
        WorkitemUpdate::Unchanged
    }
}

/// Marks a running workitem as timed out once it is `timeout_secs` past its
/// scheduled run. A zero timeout never expires.
pub fn check_timeout(item: &Workitem, timeout_secs: u64, now: DateTime<Utc>) -> WorkitemUpdate {
    if item.state != WorkitemState::Running || timeout_secs == 0 {
        return WorkitemUpdate::Unchanged;
    }
    let limit = i64::try_from(timeout_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX);
    if now - item.scheduled_run > limit {
        warn!(workitem = %item.id, timeout_secs, "workitem timed out");
        WorkitemUpdate::TimedOut(format!(
            "timed out after {timeout_secs}s past scheduled run {}",
            item.scheduled_run
        ))
    } else {
        WorkitemUpdate::Unchanged
    }
}

fn dispatch(
    item: &Workitem,
    step: &str,
    debug: bool,
    call: impl FnOnce(JobValues) -> std::result::Result<JobValues, crate::error::JobError>,
) -> Result<WorkitemUpdate> {
    match call(item.job_values()) {
        Ok(values) => Ok(WorkitemUpdate::Job(values)),
        Err(e) if debug => Err(e.into()),
        Err(e) => {
            warn!(workitem = %item.id, step, error = %e, "job step failed");
            Ok(WorkitemUpdate::Failed(e.to_string()))
        }
    }
}

/// Starts the job of a running workitem that has not been run yet and is due.
///
/// Executor failures are recorded in `error_msg` and leave the state alone so
/// the next poll retries; in debug mode they are returned instead.
pub fn run(
    item: &Workitem,
    executor: &dyn JobExecutor,
    now: DateTime<Utc>,
    debug: bool,
) -> Result<WorkitemUpdate> {
    if item.state != WorkitemState::Running || item.run {
        return Ok(WorkitemUpdate::Unchanged);
    }
    if item.scheduled_run > now {
        debug!(workitem = %item.id, scheduled_run = %item.scheduled_run, "workitem not due yet");
        return Ok(WorkitemUpdate::Unchanged);
    }
    dispatch(item, "run", debug, |values| executor.run_job(values))
}

/// Polls the job of a running workitem that has already been run.
pub fn check(item: &Workitem, executor: &dyn JobExecutor, debug: bool) -> Result<WorkitemUpdate> {
    if item.state != WorkitemState::Running || !item.run {
        return Ok(WorkitemUpdate::Unchanged);
    }
    dispatch(item, "check", debug, |values| executor.check_job(values))
}

/// Asks the executor to stop the job of a workitem that has been run.
pub fn cancel(item: &Workitem, executor: &dyn JobExecutor, debug: bool) -> Result<WorkitemUpdate> {
    if !item.run {
        return Ok(WorkitemUpdate::Unchanged);
    }
    dispatch(item, "cancel", debug, |values| executor.cancel_job(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::interval::IntervalUnit;
    use crate::job::{JobKind, RouterJob};
    use crate::model::Workflow;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    struct FailingJob;

    impl JobExecutor for FailingJob {
        fn run_job(&self, _: JobValues) -> std::result::Result<JobValues, JobError> {
            Err(JobError::Failed("connection refused".into()))
        }

        fn check_job(&self, _: JobValues) -> std::result::Result<JobValues, JobError> {
            Err(JobError::Failed("still unreachable".into()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap()
    }

    fn setup(properties: &str) -> (MemoryStore, Action) {
        let mut store = MemoryStore::new();
        let wf = Workflow::new("wf");
        store.insert_workflow(wf.clone()).unwrap();
        let mut action = Action::new(wf.id, "build", JobKind::Router);
        action.properties = properties.to_string();
        store.insert_action(action.clone()).unwrap();
        (store, action)
    }

    fn new_item(action: &Action, trigger: TriggerMode, interval: Interval) -> NewWorkitem {
        NewWorkitem {
            action: Some(action.id),
            instance: Uuid::new_v4(),
            workflow: action.workflow,
            runner_host: None,
            trigger,
            interval,
            job_metadata: json!({"repo": "core"}),
        }
    }

    fn running_item() -> Workitem {
        let (store, action) = setup("{}");
        create(&store, new_item(&action, TriggerMode::Auto, Interval::default()), now()).unwrap()
    }

    #[test]
    fn automatic_workitem_is_created_running() {
        let item = running_item();
        assert_eq!(item.state, WorkitemState::Running);
        assert_eq!(item.scheduled_run, now());
        assert!(!item.run);
        assert!(!item.triggered);
    }

    #[test]
    fn time_triggered_workitem_waits() {
        let (store, action) = setup("{}");
        let interval = Interval::new(2, IntervalUnit::Days);
        let item = create(&store, new_item(&action, TriggerMode::Time, interval), now()).unwrap();
        assert_eq!(item.state, WorkitemState::Todo);
        assert_eq!(item.scheduled_run, now() + Duration::days(2));
    }

    #[test]
    fn zero_interval_time_trigger_is_due_immediately() {
        let (store, action) = setup("{}");
        let interval = Interval::new(0, IntervalUnit::Hours);
        let item = create(&store, new_item(&action, TriggerMode::Time, interval), now()).unwrap();
        assert_eq!(item.state, WorkitemState::Running);
    }

    #[test]
    fn missing_action_is_a_validation_error() {
        let (store, action) = setup("{}");
        let mut new = new_item(&action, TriggerMode::Auto, Interval::default());
        new.action = None;
        assert!(matches!(
            create(&store, new, now()),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn properties_are_merged_under_this_job() {
        let (store, action) = setup("{'job_name': repo + '-ci'}");
        let mut new = new_item(&action, TriggerMode::Auto, Interval::default());
        new.job_metadata = json!({"repo": "core", "this_job": {"old": true}});
        let item = create(&store, new, now()).unwrap();
        assert_eq!(
            item.job_metadata,
            json!({"repo": "core", "this_job": {"job_name": "core-ci"}})
        );
    }

    #[test]
    fn bad_properties_fail_creation() {
        let (store, action) = setup("{'x': missing}");
        let result = create(&store, new_item(&action, TriggerMode::Auto, Interval::default()), now());
        assert!(matches!(result, Err(EngineError::Expression(_))));

        let (store, action) = setup("[1, 2]");
        let result = create(&store, new_item(&action, TriggerMode::Auto, Interval::default()), now());
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn non_object_metadata_is_rejected() {
        let (store, action) = setup("{}");
        let mut new = new_item(&action, TriggerMode::Auto, Interval::default());
        new.job_metadata = json!([1]);
        assert!(matches!(create(&store, new, now()), Err(EngineError::Validation(_))));
    }

    #[test]
    fn run_then_check_completes_router() {
        let mut item = running_item();
        assert!(run(&item, &RouterJob, now(), false).unwrap().apply(&mut item));
        assert!(item.run);
        assert_eq!(item.state, WorkitemState::Running);

        assert!(check(&item, &RouterJob, false).unwrap().apply(&mut item));
        assert_eq!(item.state, WorkitemState::Done);
    }

    #[test]
    fn run_before_schedule_is_a_noop() {
        let mut item = running_item();
        item.scheduled_run = now() + Duration::days(2);
        let update = run(&item, &RouterJob, now(), false).unwrap();
        assert_eq!(update, WorkitemUpdate::Unchanged);
        assert!(!item.run);
    }

    #[test]
    fn run_only_fires_once() {
        let mut item = running_item();
        item.run = true;
        assert_eq!(run(&item, &RouterJob, now(), false).unwrap(), WorkitemUpdate::Unchanged);
    }

    #[test]
    fn check_requires_run() {
        let item = running_item();
        assert_eq!(check(&item, &RouterJob, false).unwrap(), WorkitemUpdate::Unchanged);
    }

    #[test]
    fn run_failure_is_captured() {
        let mut item = running_item();
        let update = run(&item, &FailingJob, now(), false).unwrap();
        assert!(update.apply(&mut item));
        assert!(!item.run);
        assert_eq!(item.state, WorkitemState::Running);
        assert!(item.error_msg.contains("connection refused"));

        // The next poll retries.
        assert!(matches!(
            run(&item, &RouterJob, now(), false).unwrap(),
            WorkitemUpdate::Job(_)
        ));
    }

    #[test]
    fn check_failure_is_captured() {
        let mut item = running_item();
        item.run = true;
        check(&item, &FailingJob, false).unwrap().apply(&mut item);
        assert_eq!(item.state, WorkitemState::Running);
        assert!(item.error_msg.contains("still unreachable"));
    }

    #[test]
    fn debug_mode_propagates_failures() {
        let mut item = running_item();
        assert!(matches!(
            run(&item, &FailingJob, now(), true),
            Err(EngineError::Job(JobError::Failed(_)))
        ));
        item.run = true;
        assert!(check(&item, &FailingJob, true).is_err());
    }

    #[test]
    fn promote_when_due() {
        let mut item = running_item();
        item.state = WorkitemState::Todo;
        item.scheduled_run = now() + Duration::minutes(5);
        assert_eq!(promote(&item, now()), WorkitemUpdate::Unchanged);

        let update = promote(&item, now() + Duration::minutes(5));
        assert!(update.apply(&mut item));
        assert_eq!(item.state, WorkitemState::Running);
    }

    #[test]
    fn timeout_marks_exception() {
        let mut item = running_item();
        assert_eq!(check_timeout(&item, 0, now() + Duration::days(9)), WorkitemUpdate::Unchanged);
        assert_eq!(check_timeout(&item, 60, now() + Duration::seconds(60)), WorkitemUpdate::Unchanged);

        let update = check_timeout(&item, 60, now() + Duration::seconds(61));
        assert!(update.apply(&mut item));
        assert!(item.timeout);
        assert_eq!(item.state, WorkitemState::Exception);
        assert!(item.error_msg.contains("timed out"));
    }
}
