//! Terminal output: a spinner around manage cycles and colored status tables.

use std::collections::HashMap;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::Result;
use crate::manager::CycleReport;
use crate::model::{InstanceState, WorkflowState, WorkitemState};
use crate::store::{InstanceFilter, Store, WorkitemFilter};

/// Spinner shown while a manage cycle runs.
pub struct CycleProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    dim: Style,
}

impl CycleProgress {
    pub fn start(host: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("polling as {host}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    /// Clears the spinner and prints a one-line summary of the cycle.
    pub fn finish(&self, report: &CycleReport) {
        self.pb.finish_and_clear();
        if report.is_idle() {
            println!("  {} nothing to do", self.dim.apply_to("·"));
            return;
        }
        let mark = if report.failed + report.timed_out + report.transition_errors > 0 {
            self.red.apply_to("!")
        } else {
            self.green.apply_to("✓")
        };
        println!("  {mark} {}", summary(report));
    }

    pub fn fail(&self, err: &dyn std::fmt::Display) {
        self.pb.finish_and_clear();
        println!("  {} cycle aborted: {err}", self.red.apply_to("✗"));
    }
}

/// Plain text summary of a cycle.
pub fn summary(report: &CycleReport) -> String {
    let mut parts = vec![
        format!("{} ran", report.ran),
        format!("{} checked", report.checked),
        format!("{} completed", report.completed),
        format!("{} spawned", report.spawned),
        format!("{} closed", report.closed.len()),
    ];
    if report.promoted > 0 {
        parts.push(format!("{} promoted", report.promoted));
    }
    if report.failed > 0 {
        parts.push(format!("{} failed", report.failed));
    }
    if report.timed_out > 0 {
        parts.push(format!("{} timed out", report.timed_out));
    }
    if report.transition_errors > 0 {
        parts.push(format!("{} transition errors", report.transition_errors));
    }
    parts.join(", ")
}

/// One printable line of the status view.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusLine {
    Workflow { name: String, state: WorkflowState },
    Instance { name: String, state: InstanceState },
    Workitem { name: String, state: WorkitemState, error: String },
}

/// Workflows, each followed by its instances and their workitems.
pub fn status_lines(store: &impl Store) -> Result<Vec<StatusLine>> {
    let mut lines = Vec::new();
    for wf in store.workflows()? {
        let action_names: HashMap<_, _> = store
            .actions(wf.id)?
            .into_iter()
            .map(|a| (a.id, a.name))
            .collect();
        lines.push(StatusLine::Workflow {
            name: wf.name.clone(),
            state: wf.state,
        });
        for inst in store.search_instances(&InstanceFilter::new().workflow(wf.id))? {
            let inst_name = inst.display_name(&wf.name);
            let items = store.search_workitems(&WorkitemFilter::new().instance(inst.id))?;
            lines.push(StatusLine::Instance {
                name: inst_name.clone(),
                state: inst.state,
            });
            for item in items {
                let action = action_names.get(&item.action).map_or("?", String::as_str);
                lines.push(StatusLine::Workitem {
                    name: item.display_name(&inst_name, action),
                    state: item.state,
                    error: item.error_msg,
                });
            }
        }
    }
    Ok(lines)
}

pub fn print_status(store: &impl Store) -> Result<()> {
    let lines = status_lines(store)?;
    if lines.is_empty() {
        println!("No workflows loaded.");
        return Ok(());
    }
    let bold = Style::new().bold();
    for line in lines {
        match line {
            StatusLine::Workflow { name, state } => {
                println!("{} [{state}]", bold.apply_to(name));
            }
            StatusLine::Instance { name, state } => {
                let style = match state {
                    InstanceState::Done => Style::new().green(),
                    InstanceState::Running => Style::new().cyan(),
                };
                println!("  {name} {}", style.apply_to(state));
            }
            StatusLine::Workitem { name, state, error } => {
                println!("    {name} {}", workitem_style(state).apply_to(state));
                if !error.is_empty() {
                    println!("      {}", Style::new().red().apply_to(error));
                }
            }
        }
    }
    Ok(())
}

fn workitem_style(state: WorkitemState) -> Style {
    match state {
        WorkitemState::Done => Style::new().green(),
        WorkitemState::Running => Style::new().cyan(),
        WorkitemState::Todo => Style::new().yellow(),
        WorkitemState::Cancelled => Style::new().dim(),
        WorkitemState::Exception => Style::new().red().bold(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{StartRequest, run_workflow};
    use crate::job::JobKind;
    use crate::model::{Action, Workflow};
    use crate::store::{MemoryStore, WorkflowStore};
    use chrono::Utc;

    #[test]
    fn summary_lists_only_relevant_problems() {
        let report = CycleReport {
            ran: 2,
            failed: 1,
            ..Default::default()
        };
        let text = summary(&report);
        assert!(text.starts_with("2 ran, 0 checked"));
        assert!(text.ends_with("1 failed"));
        assert!(!text.contains("timed out"));
    }

    #[test]
    fn status_lines_nest_instances_and_workitems() {
        let mut store = MemoryStore::new();
        assert!(status_lines(&store).unwrap().is_empty());

        let mut wf = Workflow::new("nightly");
        wf.state = WorkflowState::Published;
        store.insert_workflow(wf.clone()).unwrap();
        let mut start = Action::new(wf.id, "kickoff", JobKind::Router);
        start.start = true;
        store.insert_action(start).unwrap();
        run_workflow(&mut store, wf.id, StartRequest::default(), Utc::now()).unwrap();

        let lines = status_lines(&store).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(matches!(&lines[0], StatusLine::Workflow { name, .. } if name == "nightly"));
        assert!(matches!(&lines[1], StatusLine::Instance { state: InstanceState::Running, .. }));
        match &lines[2] {
            StatusLine::Workitem { name, state, .. } => {
                assert!(name.ends_with("router - kickoff"));
                assert_eq!(*state, WorkitemState::Running);
            }
            other => panic!("expected workitem line, got {other:?}"),
        }
    }
}
