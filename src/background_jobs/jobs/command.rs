//! Jobs that run an external program.
//!
//! Declared in the config file under `[[command_jobs]]`. Request parameters are
//! exported to the child as `JOB_PARAM_<KEY>` environment variables, alongside
//! `JOB_NAME` and `JOB_REQUEST_ID`.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule, ShutdownBehavior},
};
use crate::config::CommandJobConfig;
use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Lines of stderr kept for the error message.
const STDERR_TAIL_LINES: usize = 20;

pub struct CommandJob {
    name: String,
    description: String,
    program: String,
    args: Vec<String>,
    schedule: JobSchedule,
    exclusivity_class: String,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    shutdown_behavior: ShutdownBehavior,
}

impl CommandJob {
    pub fn from_config(config: &CommandJobConfig) -> Result<Self> {
        if config.name.trim().is_empty() {
            bail!("Command job name must not be empty");
        }
        let Some(mut words) = shlex::split(&config.command) else {
            bail!(
                "Command job {}: could not parse command line {:?}",
                config.name,
                config.command
            );
        };
        if words.is_empty() {
            bail!("Command job {}: command must not be empty", config.name);
        }
        let program = words.remove(0);

        let schedule = match config.interval_secs {
            Some(0) => bail!("Command job {}: interval_secs must be positive", config.name),
            Some(secs) => JobSchedule::Interval(Duration::from_secs(secs)),
            None => JobSchedule::Manual,
        };

        Ok(Self {
            name: config.name.clone(),
            description: config
                .description
                .clone()
                .unwrap_or_else(|| format!("Run `{}`", config.command)),
            program,
            args: words,
            schedule,
            exclusivity_class: config
                .exclusivity_class
                .clone()
                .unwrap_or_else(|| config.name.clone()),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
            timeout: config.timeout_secs.map(Duration::from_secs),
            shutdown_behavior: if config.cancellable {
                ShutdownBehavior::Cancellable
            } else {
                ShutdownBehavior::WaitForCompletion
            },
        })
    }

    fn build_command(&self, ctx: &JobContext) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("JOB_NAME", &ctx.job_name)
            .env("JOB_REQUEST_ID", &ctx.request_id);
        for (key, value) in &ctx.params {
            command.env(param_env_var(key), value);
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }

    /// Poll the child until it exits, the job is cancelled or the timeout expires.
    fn wait(&self, child: &mut Child, ctx: &JobContext) -> Result<ExitStatus, JobError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    kill(child, &self.name);
                    return Err(JobError::ExecutionFailed(format!(
                        "Failed to wait for child: {}",
                        e
                    )));
                }
            }

            if ctx.is_cancelled() {
                info!("Cancelling command job {}", self.name);
                kill(child, &self.name);
                return Err(JobError::Cancelled);
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    warn!("Command job {} timed out after {:?}", self.name, timeout);
                    kill(child, &self.name);
                    return Err(JobError::Timeout(timeout));
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// `episode-id` -> `JOB_PARAM_EPISODE_ID`
fn param_env_var(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("JOB_PARAM_{}", sanitized)
}

fn kill(child: &mut Child, job_name: &str) {
    if let Err(e) = child.kill() {
        debug!("Failed to kill child of {}: {}", job_name, e);
    }
    let _ = child.wait();
}

/// Read a child stream line by line on its own thread, keeping the last lines.
fn drain<R: Read + Send + 'static>(
    stream: Option<R>,
    job_name: String,
    label: &'static str,
) -> Option<JoinHandle<VecDeque<String>>> {
    let stream = stream?;
    Some(std::thread::spawn(move || {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        for line in BufReader::new(stream).lines().map_while(|l| l.ok()) {
            debug!("[{} {}] {}", job_name, label, line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    }))
}

impl BackgroundJob for CommandJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schedule(&self) -> JobSchedule {
        self.schedule
    }

    fn exclusivity_class(&self) -> &str {
        &self.exclusivity_class
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        self.shutdown_behavior
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let mut child = self.build_command(ctx).spawn().map_err(|e| {
            JobError::ExecutionFailed(format!("Failed to start {}: {}", self.program, e))
        })?;
        debug!("Command job {} started as pid {}", self.name, child.id());

        let stdout = drain(child.stdout.take(), self.name.clone(), "stdout");
        let stderr = drain(child.stderr.take(), self.name.clone(), "stderr");

        let status = self.wait(&mut child, ctx);

        if let Some(handle) = stdout {
            let _ = handle.join();
        }
        let stderr_tail = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        let status = status?;
        if status.success() {
            return Ok(());
        }

        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let mut message = format!("{} exited with status {}", self.program, code);
        if !stderr_tail.is_empty() {
            message.push_str(": ");
            message.push_str(&Vec::from(stderr_tail).join("\n"));
        }
        Err(JobError::ExecutionFailed(message))
    }
}
