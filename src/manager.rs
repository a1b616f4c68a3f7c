//! The manage loop: one synchronous poll cycle over all open work.
//!
//! A cycle runs three phases in order:
//!
//! 1. run or check every active workitem this host can execute,
//! 2. fire transitions of done workitems that have not been triggered,
//! 3. close instances whose workitems are all done and triggered.
//!
//! Workitems completed in phase 1 are left for the next cycle in phases 2
//! and 3, so each cycle only acts on state that existed when it started or
//! that it produced itself in phase 1. Overlapping cycles on the same store
//! are not safe; callers must serialize them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::instance;
use crate::job::JobRegistry;
use crate::model::{InstanceId, InstanceState, Workitem, WorkitemId, WorkitemState};
use crate::store::{InstanceFilter, Store, WorkitemFilter};
use crate::transition;
use crate::workitem::{self, WorkitemUpdate};

/// Workitem states that are never polled again.
pub const INACTIVE_STATES: [WorkitemState; 3] = [
    WorkitemState::Done,
    WorkitemState::Cancelled,
    WorkitemState::Exception,
];

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub promoted: usize,
    pub ran: usize,
    pub checked: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub completed: usize,
    pub spawned: usize,
    pub triggered: usize,
    pub transition_errors: usize,
    pub closed: Vec<InstanceId>,
}

impl CycleReport {
    /// Whether the cycle changed anything.
    pub fn is_idle(&self) -> bool {
        *self == CycleReport::default()
    }
}

/// Drives workitems and instances forward using the executors of one host.
pub struct JobManager {
    registry: JobRegistry,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new(JobRegistry::default())
    }
}

impl JobManager {
    pub fn new(registry: JobRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Runs one cycle at the current time.
    pub fn manage_jobs(&self, store: &mut impl Store, host: &str, debug: bool) -> Result<CycleReport> {
        self.manage_jobs_at(store, host, debug, Utc::now())
    }

    /// Runs one cycle as if the time were `now`.
    ///
    /// In debug mode the first executor or expression error aborts the
    /// cycle and is returned.
    pub fn manage_jobs_at(
        &self,
        store: &mut impl Store,
        host: &str,
        debug: bool,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let mut completed_now: BTreeSet<WorkitemId> = BTreeSet::new();
        let mut touched_instances: BTreeSet<InstanceId> = BTreeSet::new();

        let active = store.search_workitems(&WorkitemFilter::new().not_in(&INACTIVE_STATES))?;
        for item in active.into_iter().filter(|w| self.is_claimable(w, host)) {
            let item = self.advance(store, item, now, debug, &mut report)?;
            if item.state == WorkitemState::Done {
                report.completed += 1;
                completed_now.insert(item.id);
                touched_instances.insert(item.instance);
            }
        }

        let fireable = store.search_workitems(
            &WorkitemFilter::new()
                .state(WorkitemState::Done)
                .triggered(false),
        )?;
        for mut item in fireable.into_iter().filter(|w| !completed_now.contains(&w.id)) {
            let outcome = transition::fire(&*store, &item, now, debug)?;
            for successor in &outcome.spawned {
                store.insert_workitem(successor.clone())?;
            }
            report.spawned += outcome.spawned.len();
            report.transition_errors += outcome.errors.len();
            if outcome.triggered {
                report.triggered += 1;
            }
            outcome.apply(&mut item);
            store.update_workitem(&item)?;
        }

        let open = store.search_instances(&InstanceFilter::new().not_in(&[InstanceState::Done]))?;
        for inst in open.into_iter().filter(|i| !touched_instances.contains(&i.id)) {
            if instance::close_if_complete(store, inst.id)? {
                report.closed.push(inst.id);
            }
        }

        if report.is_idle() {
            debug!(host, "cycle finished with nothing to do");
        } else {
            info!(
                host,
                ran = report.ran,
                checked = report.checked,
                completed = report.completed,
                spawned = report.spawned,
                closed = report.closed.len(),
                "cycle finished"
            );
        }
        Ok(report)
    }

    /// This host polls workitems of kinds it has an executor for, unless
    /// the workitem asks for a different host.
    fn is_claimable(&self, item: &Workitem, host: &str) -> bool {
        self.registry.handles(item.job_kind)
            && item.runner_host.as_deref().is_none_or(|h| h == host)
    }

    /// Promotes, times out, runs and checks one workitem, storing it once if
    /// anything changed.
    fn advance(
        &self,
        store: &mut impl Store,
        mut item: Workitem,
        now: DateTime<Utc>,
        debug: bool,
        report: &mut CycleReport,
    ) -> Result<Workitem> {
        let executor = self.registry.get(item.job_kind)?;
        let mut changed = false;

        if workitem::promote(&item, now).apply(&mut item) {
            report.promoted += 1;
            changed = true;
        }

        let timeout_secs = store.action(item.action)?.timeout_secs;
        let timeout = workitem::check_timeout(&item, timeout_secs, now);
        if matches!(timeout, WorkitemUpdate::TimedOut(_)) {
            let cancel = workitem::cancel(&item, executor, debug)?;
            if matches!(cancel, WorkitemUpdate::Failed(_)) {
                report.failed += 1;
            }
            cancel.apply(&mut item);
            timeout.apply(&mut item);
            report.timed_out += 1;
            store.update_workitem(&item)?;
            return Ok(item);
        }

        if item.state == WorkitemState::Running && !item.run {
            let update = workitem::run(&item, executor, now, debug)?;
            if matches!(update, WorkitemUpdate::Failed(_)) {
                report.failed += 1;
            }
            changed |= update.apply(&mut item);
            if item.run {
                report.ran += 1;
            }
        }

        if item.state == WorkitemState::Running && item.run {
            let update = workitem::check(&item, executor, debug)?;
            if matches!(update, WorkitemUpdate::Failed(_)) {
                report.failed += 1;
            }
            changed |= update.apply(&mut item);
            report.checked += 1;
        }

        if changed {
            store.update_workitem(&item)?;
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, JobError};
    use crate::instance::{StartRequest, run_workflow};
    use crate::interval::{Interval, IntervalUnit};
    use crate::job::{JobExecutor, JobKind, JobValues, process_alive};
    use crate::model::{Action, Transition, TriggerMode, Workflow, WorkflowState};
    use crate::store::{InstanceStore, MemoryStore, WorkflowStore, WorkitemStore};
    use crate::workflow::{add_action, add_transition};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap()
    }

    /// Fails `run_job` a fixed number of times, then behaves like a router.
    struct FlakyJob {
        failures_left: Arc<AtomicUsize>,
        runs: Arc<AtomicUsize>,
    }

    impl JobExecutor for FlakyJob {
        fn run_job(&self, mut values: JobValues) -> std::result::Result<JobValues, JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(JobError::Failed("endpoint unavailable".into()));
            }
            values.run = true;
            Ok(values)
        }

        fn check_job(&self, mut values: JobValues) -> std::result::Result<JobValues, JobError> {
            values.state = WorkitemState::Done;
            Ok(values)
        }
    }

    /// Never finishes.
    struct PendingJob;

    impl JobExecutor for PendingJob {
        fn run_job(&self, mut values: JobValues) -> std::result::Result<JobValues, JobError> {
            values.run = true;
            Ok(values)
        }

        fn check_job(&self, values: JobValues) -> std::result::Result<JobValues, JobError> {
            Ok(values)
        }
    }

    struct Fixture {
        store: MemoryStore,
        wf: Workflow,
        start: Action,
    }

    fn fixture() -> Fixture {
        let mut store = MemoryStore::new();
        let mut wf = Workflow::new("pipeline");
        wf.state = WorkflowState::Published;
        store.insert_workflow(wf.clone()).unwrap();
        let mut start = Action::new(wf.id, "A", JobKind::Router);
        start.start = true;
        add_action(&mut store, start.clone()).unwrap();
        Fixture { store, wf, start }
    }

    fn add(f: &mut Fixture, name: &str, kind: JobKind) -> Action {
        let action = Action::new(f.wf.id, name, kind);
        add_action(&mut f.store, action.clone()).unwrap();
        action
    }

    fn connect(f: &mut Fixture, from: &Action, to: &Action) -> Transition {
        let t = Transition::new(from.id, to.id);
        add_transition(&mut f.store, t.clone()).unwrap();
        t
    }

    fn start(f: &mut Fixture, now: DateTime<Utc>) -> (InstanceId, WorkitemId) {
        let (inst, item) = run_workflow(&mut f.store, f.wf.id, StartRequest::default(), now).unwrap();
        (inst.id, item.id)
    }

    fn items_of(f: &Fixture, action: &Action) -> Vec<Workitem> {
        f.store
            .search_workitems(&WorkitemFilter::new())
            .unwrap()
            .into_iter()
            .filter(|w| w.action == action.id)
            .collect()
    }

    #[test]
    fn two_action_scenario_converges_in_four_cycles() {
        let mut f = fixture();
        let a = f.start.clone();
        let b = add(&mut f, "B", JobKind::Router);
        let t = connect(&mut f, &a, &b);
        let (inst, wi1) = start(&mut f, t0());
        let manager = JobManager::default();

        // Cycle 1: WI1 runs and completes; nothing fires yet.
        let r = manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        assert_eq!((r.ran, r.checked, r.completed, r.spawned), (1, 1, 1, 0));
        let item = f.store.workitem(wi1).unwrap();
        assert_eq!(item.state, WorkitemState::Done);
        assert!(!item.triggered);
        assert!(items_of(&f, &b).is_empty());

        // Cycle 2: T fires, WI2 created running; WI1 not marked triggered yet.
        let r = manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        assert_eq!(r.spawned, 1);
        let item = f.store.workitem(wi1).unwrap();
        assert!(item.completed.contains(&t.id));
        assert!(!item.triggered);
        let wi2 = items_of(&f, &b).pop().unwrap();
        assert_eq!(wi2.state, WorkitemState::Running);
        assert_eq!(f.store.instance(inst).unwrap().state, InstanceState::Running);

        // Cycle 3: WI2 completes; WI1 has nothing left and becomes triggered.
        let r = manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        assert_eq!(r.completed, 1);
        assert!(f.store.workitem(wi1).unwrap().triggered);
        assert_eq!(f.store.workitem(wi2.id).unwrap().state, WorkitemState::Done);
        assert_eq!(f.store.instance(inst).unwrap().state, InstanceState::Running);

        // Cycle 4: WI2 triggered without successors; instance closes.
        let r = manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        assert_eq!(r.closed, vec![inst]);
        assert!(f.store.workitem(wi2.id).unwrap().triggered);
        assert_eq!(items_of(&f, &b).len(), 1);
        assert_eq!(f.store.instance(inst).unwrap().state, InstanceState::Done);

        // Nothing left to do.
        let r = manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        assert!(r.is_idle());
    }

    #[test]
    fn time_delayed_successor_waits_for_its_schedule() {
        let mut f = fixture();
        let a = f.start.clone();
        let b = add(&mut f, "B", JobKind::Router);
        let mut t = Transition::new(a.id, b.id);
        t.trigger = TriggerMode::Time;
        t.interval = Interval::new(2, IntervalUnit::Days);
        add_transition(&mut f.store, t).unwrap();
        start(&mut f, t0());
        let manager = JobManager::default();

        manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        let fired_at = t0() + Duration::minutes(5);
        manager.manage_jobs_at(&mut f.store, "local", false, fired_at).unwrap();

        let wi2 = items_of(&f, &b).pop().unwrap();
        assert_eq!(wi2.scheduled_run, fired_at + Duration::days(2));
        assert_eq!(wi2.state, WorkitemState::Todo);

        let before = fired_at + Duration::days(1);
        let r = manager.manage_jobs_at(&mut f.store, "local", false, before).unwrap();
        assert_eq!(r.ran, 0);
        let wi2 = f.store.workitem(wi2.id).unwrap();
        assert_eq!(wi2.state, WorkitemState::Todo);
        assert!(!wi2.run);

        let due = fired_at + Duration::days(2);
        let r = manager.manage_jobs_at(&mut f.store, "local", false, due).unwrap();
        assert_eq!((r.promoted, r.ran), (1, 1));
        assert_eq!(f.store.workitem(wi2.id).unwrap().state, WorkitemState::Done);
    }

    #[test]
    fn executor_failure_is_recorded_and_retried() {
        let mut f = fixture();
        let a = f.start.clone();
        let flaky = add(&mut f, "flaky", JobKind::Draft);
        connect(&mut f, &a, &flaky);
        start(&mut f, t0());

        let failures_left = Arc::new(AtomicUsize::new(1));
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = JobRegistry::default();
        registry.register(
            JobKind::Draft,
            FlakyJob {
                failures_left: failures_left.clone(),
                runs: runs.clone(),
            },
        );
        let manager = JobManager::new(registry);

        manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();

        let r = manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        assert_eq!(r.failed, 1);
        let item = items_of(&f, &flaky).pop().unwrap();
        assert!(!item.run);
        assert_eq!(item.state, WorkitemState::Running);
        assert!(item.error_msg.contains("endpoint unavailable"));

        let r = manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        assert_eq!(r.ran, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(items_of(&f, &flaky).pop().unwrap().state, WorkitemState::Done);
    }

    #[test]
    fn debug_mode_aborts_the_cycle() {
        let mut f = fixture();
        let a = f.start.clone();
        let flaky = add(&mut f, "flaky", JobKind::Draft);
        connect(&mut f, &a, &flaky);
        start(&mut f, t0());

        let mut registry = JobRegistry::default();
        registry.register(
            JobKind::Draft,
            FlakyJob {
                failures_left: Arc::new(AtomicUsize::new(5)),
                runs: Arc::new(AtomicUsize::new(0)),
            },
        );
        let manager = JobManager::new(registry);
        manager.manage_jobs_at(&mut f.store, "local", true, t0()).unwrap();
        manager.manage_jobs_at(&mut f.store, "local", true, t0()).unwrap();

        let result = manager.manage_jobs_at(&mut f.store, "local", true, t0());
        assert!(matches!(result, Err(EngineError::Job(JobError::Failed(_)))));
    }

    #[test]
    fn fan_out_closes_after_all_branches() {
        let mut f = fixture();
        let a = f.start.clone();
        let b = add(&mut f, "B", JobKind::Router);
        let c = add(&mut f, "C", JobKind::Draft);
        connect(&mut f, &a, &b);
        connect(&mut f, &a, &c);
        let (inst, _) = start(&mut f, t0());
        let manager = JobManager::default();

        for _ in 0..6 {
            manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        }
        assert_eq!(items_of(&f, &b).len(), 1);
        assert_eq!(items_of(&f, &c).len(), 1);
        assert_eq!(f.store.instance(inst).unwrap().state, InstanceState::Done);
    }

    #[test]
    fn timeout_moves_workitem_to_exception() {
        let mut f = fixture();
        let a = f.start.clone();
        let mut slow = Action::new(f.wf.id, "slow", JobKind::Draft);
        slow.timeout_secs = 600;
        add_action(&mut f.store, slow.clone()).unwrap();
        connect(&mut f, &a, &slow);
        let (inst, _) = start(&mut f, t0());

        let mut registry = JobRegistry::default();
        registry.register(JobKind::Draft, PendingJob);
        let manager = JobManager::new(registry);
        manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        manager.manage_jobs_at(&mut f.store, "local", false, t0() + Duration::minutes(5)).unwrap();
        assert_eq!(items_of(&f, &slow).pop().unwrap().state, WorkitemState::Running);

        let r = manager
            .manage_jobs_at(&mut f.store, "local", false, t0() + Duration::minutes(11))
            .unwrap();
        assert_eq!(r.timed_out, 1);
        let item = items_of(&f, &slow).pop().unwrap();
        assert!(item.timeout);
        assert_eq!(item.state, WorkitemState::Exception);

        // Exception is terminal: no more polling, and the instance never closes.
        let r = manager
            .manage_jobs_at(&mut f.store, "local", false, t0() + Duration::minutes(20))
            .unwrap();
        assert_eq!(r.checked, 0);
        assert_eq!(f.store.instance(inst).unwrap().state, InstanceState::Running);
    }

    #[test]
    fn timed_out_command_is_killed() {
        let mut f = fixture();
        let a = f.start.clone();
        let mut sleeper = Action::new(f.wf.id, "sleeper", JobKind::Command);
        sleeper.properties = "{'command': 'sleep', 'args': ['30']}".into();
        sleeper.timeout_secs = 60;
        add_action(&mut f.store, sleeper.clone()).unwrap();
        connect(&mut f, &a, &sleeper);
        start(&mut f, t0());
        let manager = JobManager::default();

        for _ in 0..3 {
            manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        }
        let item = items_of(&f, &sleeper).pop().unwrap();
        assert!(item.run);
        assert_eq!(item.state, WorkitemState::Running);
        assert!(process_alive(item.pid).unwrap());

        let r = manager
            .manage_jobs_at(&mut f.store, "local", false, t0() + Duration::minutes(2))
            .unwrap();
        assert_eq!((r.timed_out, r.failed), (1, 0));
        let item = f.store.workitem(item.id).unwrap();
        assert_eq!(item.state, WorkitemState::Exception);
        assert!(item.timeout);
        assert!(!process_alive(item.pid).unwrap());
    }

    #[test]
    fn failing_condition_keeps_instance_open() {
        let mut f = fixture();
        let a = f.start.clone();
        let b = add(&mut f, "B", JobKind::Router);
        let mut t = Transition::new(a.id, b.id);
        t.condition = "metadata.missing == 1".into();
        add_transition(&mut f.store, t).unwrap();
        let (inst, wi1) = start(&mut f, t0());
        let manager = JobManager::default();

        manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        for _ in 0..4 {
            let r = manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
            assert_eq!(r.transition_errors, 1);
            assert!(r.closed.is_empty());
        }
        let item = f.store.workitem(wi1).unwrap();
        assert_eq!(item.state, WorkitemState::Done);
        assert!(!item.triggered);
        assert!(!item.error_msg.is_empty());
        assert!(items_of(&f, &b).is_empty());
        assert_eq!(f.store.instance(inst).unwrap().state, InstanceState::Running);
    }

    #[test]
    fn cancelled_and_exception_items_are_not_polled() {
        let mut f = fixture();
        let (_, wi1) = start(&mut f, t0());
        let manager = JobManager::default();

        for state in [WorkitemState::Cancelled, WorkitemState::Exception] {
            let mut item = f.store.workitem(wi1).unwrap();
            item.state = state;
            f.store.update_workitem(&item).unwrap();
            let r = manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
            assert_eq!((r.ran, r.checked), (0, 0));
            assert!(!f.store.workitem(wi1).unwrap().run);
        }
    }

    #[test]
    fn host_affinity_and_registered_kinds() {
        let mut f = fixture();
        let request = StartRequest {
            runner_host: Some("builder".into()),
            ..Default::default()
        };
        let (_, item) = run_workflow(&mut f.store, f.wf.id, request, t0()).unwrap();

        let manager = JobManager::default();
        let r = manager.manage_jobs_at(&mut f.store, "other-host", false, t0()).unwrap();
        assert_eq!(r.ran, 0);

        let routerless = JobManager::new(JobRegistry::empty());
        let r = routerless.manage_jobs_at(&mut f.store, "builder", false, t0()).unwrap();
        assert_eq!(r.ran, 0);

        let r = manager.manage_jobs_at(&mut f.store, "builder", false, t0()).unwrap();
        assert_eq!(r.ran, 1);
        assert_eq!(f.store.workitem(item.id).unwrap().state, WorkitemState::Done);
    }

    #[test]
    fn false_condition_leaves_dead_end() {
        let mut f = fixture();
        let a = f.start.clone();
        let b = add(&mut f, "B", JobKind::Router);
        let mut t = Transition::new(a.id, b.id);
        t.condition = "metadata.get('deploy', False)".into();
        add_transition(&mut f.store, t).unwrap();
        let (inst, _) = start(&mut f, t0());
        let manager = JobManager::default();

        for _ in 0..4 {
            manager.manage_jobs_at(&mut f.store, "local", false, t0()).unwrap();
        }
        assert!(items_of(&f, &b).is_empty());
        assert_eq!(f.store.instance(inst).unwrap().state, InstanceState::Done);
    }
}
