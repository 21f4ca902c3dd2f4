pub mod tasks;

use std::future::Future;

use anyhow::{bail, Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

/// Cron-driven background jobs that run alongside the relay.
///
/// Jobs are registered before [`start`](Self::start); the scheduler is
/// consumed by [`shutdown`](Self::shutdown) once the relay has stopped.
pub struct Scheduler {
    inner: JobScheduler,
    jobs: Vec<String>,
}

impl Scheduler {
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self {
            inner,
            jobs: Vec::new(),
        })
    }

    /// Names of the registered jobs, in registration order
    pub fn jobs(&self) -> &[String] {
        &self.jobs
    }

    /// Run `task` on a six-field cron schedule (seconds first). Each tick
    /// gets a fresh future from `task`.
    pub async fn add_cron_job<F, Fut>(&mut self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.jobs.iter().any(|job| job == name) {
            bail!("Job '{}' is already scheduled", name);
        }

        let tick_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let tick = task();
            let name = tick_name.clone();
            Box::pin(async move {
                debug!(job = %name, "Cron tick");
                tick.await;
            })
        })
        .with_context(|| format!("Invalid cron expression for job '{}': {}", name, cron_expr))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to register job '{}'", name))?;
        self.jobs.push(name.to_string());

        debug!(job = %name, cron = %cron_expr, "Registered cron job");
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        if self.jobs.is_empty() {
            bail!("Refusing to start a scheduler with no jobs");
        }
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler running {} job(s): {}", self.jobs.len(), self.jobs.join(", "));
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to stop scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}
