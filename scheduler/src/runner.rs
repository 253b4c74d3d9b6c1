// Job runner used by the standalone scheduler binary

use common::errors::ExecutionError;
use common::models::{CompletedExecutionInstruction, TriggerFiredBundle};
use common::scheduler::{JobExecutionResult, JobRunner};
use tracing::info;

/// Logs every fired trigger and asks the store to requeue it.
///
/// Deployments embedding the scheduler library plug in their own runner;
/// the binary only demonstrates the firing cycle end to end.
pub struct LoggingJobRunner;

impl JobRunner for LoggingJobRunner {
    fn run(&self, bundle: &TriggerFiredBundle) -> Result<JobExecutionResult, ExecutionError> {
        info!(
            job_key = %bundle.job.key,
            trigger_key = %bundle.trigger.key,
            fire_time = %bundle.fire_time,
            scheduled_fire_time = ?bundle.scheduled_fire_time,
            next_fire_time = ?bundle.next_fire_time,
            "Job fired"
        );

        Ok(JobExecutionResult {
            instruction: CompletedExecutionInstruction::Noop,
            job_data: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::models::{JobDetail, JobKey, Schedule, Trigger, TriggerKey};

    #[test]
    fn test_logging_runner_requeues() {
        let job_key = JobKey::new("g", "j");
        let now = Utc::now();
        let bundle = TriggerFiredBundle {
            job: JobDetail::new(job_key.clone()),
            trigger: Trigger::new(
                TriggerKey::new("g", "t"),
                job_key,
                Schedule::OneTime { execute_at: now },
            ),
            fire_time: now,
            scheduled_fire_time: Some(now),
            previous_fire_time: Some(now),
            next_fire_time: None,
        };

        let result = LoggingJobRunner.run(&bundle).unwrap();
        assert_eq!(result.instruction, CompletedExecutionInstruction::Noop);
        assert!(result.job_data.is_none());
    }
}
