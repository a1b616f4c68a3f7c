use tracing::info;

use super::{JobExecutor, JobValues};
use crate::error::JobError;
use crate::model::WorkitemState;

/// Does no work of its own: runs immediately and is done on first check.
pub struct RouterJob;

impl JobExecutor for RouterJob {
    fn run_job(&self, mut values: JobValues) -> Result<JobValues, JobError> {
        info!("router job is running");
        values.run = true;
        Ok(values)
    }

    fn check_job(&self, mut values: JobValues) -> Result<JobValues, JobError> {
        info!("router job is done");
        values.state = WorkitemState::Done;
        Ok(values)
    }
}

/// Stand-in for a job whose implementation does not exist yet.
/// Behaves like [`RouterJob`] so a workflow can be exercised end to end.
pub struct DraftJob;

impl JobExecutor for DraftJob {
    fn run_job(&self, mut values: JobValues) -> Result<JobValues, JobError> {
        info!("draft job is running");
        values.run = true;
        Ok(values)
    }

    fn check_job(&self, mut values: JobValues) -> Result<JobValues, JobError> {
        info!("draft job is done");
        values.state = WorkitemState::Done;
        Ok(values)
    }
}
