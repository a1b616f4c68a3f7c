//! Fires the outgoing transitions of completed workitems.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::expr::{self, Context};
use crate::model::{TransitionId, Workitem, WorkitemState};
use crate::store::WorkflowStore;
use crate::workitem::{self, NewWorkitem};

/// Result of evaluating a workitem's transitions.
#[derive(Debug, Clone, Default)]
pub struct TransitionOutcome {
    /// Successor workitems, created but not yet stored.
    pub spawned: Vec<Workitem>,
    /// Transitions evaluated this time, whether they fired or not.
    pub completed: Vec<TransitionId>,
    /// Set only when no transition was left to evaluate.
    pub triggered: bool,
    /// Per-transition evaluation failures.
    pub errors: Vec<String>,
}

impl TransitionOutcome {
    /// Records the outcome on the source workitem.
    pub fn apply(&self, item: &mut Workitem) {
        item.completed.extend(self.completed.iter().copied());
        if self.triggered {
            item.triggered = true;
        }
        if !self.errors.is_empty() {
            item.error_msg = self.errors.join("; ");
        }
    }
}

/// Evaluates every outgoing transition of `item`'s action not yet in its
/// completed set, spawning a successor for each condition that holds.
///
/// A transition whose condition or successor cannot be evaluated is left
/// out of the completed set and reported in `errors`, so it is retried on
/// the next cycle. In debug mode the first such error is returned.
pub fn fire(
    store: &impl WorkflowStore,
    item: &Workitem,
    now: DateTime<Utc>,
    debug: bool,
) -> Result<TransitionOutcome> {
    let mut outcome = TransitionOutcome::default();
    if item.state != WorkitemState::Done || item.triggered {
        return Ok(outcome);
    }

    let remaining: Vec<_> = store
        .outgoing(item.action)?
        .into_iter()
        .filter(|t| !item.completed.contains(&t.id))
        .collect();

    if remaining.is_empty() {
        debug!(workitem = %item.id, "no transitions left, marking triggered");
        outcome.triggered = true;
        return Ok(outcome);
    }

    let ctx = Context::new()
        .with("metadata", item.job_metadata.clone())
        .with("workitem", item.expression_view());

    for transition in remaining {
        let holds = match expr::evaluate_condition(&transition.condition, &ctx) {
            Ok(holds) => holds,
            Err(e) if debug => return Err(e.into()),
            Err(e) => {
                warn!(workitem = %item.id, transition = %transition.id, error = %e, "condition failed");
                outcome
                    .errors
                    .push(format!("condition `{}`: {e}", transition.condition_name));
                continue;
            }
        };

        if holds {
            let new = NewWorkitem {
                action: Some(transition.to),
                instance: item.instance,
                workflow: item.workflow,
                runner_host: item.runner_host.clone(),
                trigger: transition.trigger,
                interval: transition.interval,
                job_metadata: item.job_metadata.clone(),
            };
            match workitem::create(store, new, now) {
                Ok(successor) => {
                    info!(
                        workitem = %item.id,
                        successor = %successor.id,
                        transition = %transition.display_name(),
                        "transition fired"
                    );
                    outcome.spawned.push(successor);
                }
                Err(e) if debug => return Err(e),
                Err(e) => {
                    warn!(workitem = %item.id, transition = %transition.id, error = %e, "successor creation failed");
                    outcome
                        .errors
                        .push(format!("transition `{}`: {e}", transition.display_name()));
                    continue;
                }
            }
        } else {
            debug!(workitem = %item.id, transition = %transition.id, "condition is false");
        }
        outcome.completed.push(transition.id);
    }

    Ok(outcome)
}
