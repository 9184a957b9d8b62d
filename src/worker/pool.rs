use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::naming::{self, VmClass};
use crate::pool::{CloneQueue, CloneTask, PendingCounter, PoolView, WorkerResult, WorkerStatus};
use crate::vsphere::Gateway;

/// How long after worker termination the result line may still be sitting
/// in the pipe.
const RESULT_GRACE: Duration = Duration::from_secs(2);

/// Best-effort fault marking for builds whose worker could not do it
/// itself (crash, timeout, failed cleanup). Infallible: failures are
/// logged, never propagated.
#[async_trait]
pub trait FaultMarker: Send + Sync {
    async fn mark_fault(&self, vm_name: &str);
}

/// Production marker: opens a transient vCenter session per call. The
/// worker's own session died with the worker, so nothing is reused here.
pub struct TransientSessionFaultMarker {
    cfg: Config,
}

impl TransientSessionFaultMarker {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl FaultMarker for TransientSessionFaultMarker {
    async fn mark_fault(&self, vm_name: &str) {
        let cfg = self.cfg.clone();
        let name = vm_name.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let gateway = Gateway::connect(&cfg)?;
            let view = PoolView::new(gateway, &cfg.vm_prefix);
            view.mark_fault_by_name(&name)
        })
        .await;
        match outcome {
            Ok(Ok(())) => info!(vm = vm_name, "marked faulty"),
            Ok(Err(e)) => error!(vm = vm_name, error = %e, "mark_fault failed"),
            Err(e) => error!(vm = vm_name, error = %e, "mark_fault task panicked"),
        }
    }
}

/// The argv prefix a worker process is spawned with; the job id is appended
/// as the final argument. Injectable so pool accounting is testable with
/// scripted commands.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    argv: Vec<String>,
}

impl WorkerCommand {
    /// Re-exec this binary with the hidden `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("resolving current executable")?;
        Ok(Self {
            argv: vec![
                exe.to_string_lossy().into_owned(),
                "worker".to_string(),
                "--job-id".to_string(),
            ],
        })
    }

    pub fn custom(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn command(&self, task: &CloneTask) -> Command {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .arg(task.job_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// Bounded spawner of clone-worker processes.
///
/// Holds at most `builder_proc` live workers, enforces the hard per-job
/// deadline, reaps the single result line, and guarantees exactly one
/// `pending.dec()` and `task_done()` per task regardless of how the worker
/// died.
pub struct BuilderPool {
    queue: Arc<CloneQueue>,
    pending: Arc<PendingCounter>,
    worker_cmd: WorkerCommand,
    fault_marker: Arc<dyn FaultMarker>,
    env: String,
    builder_proc: usize,
    worker_timeout: Duration,
}

impl BuilderPool {
    pub fn new(
        queue: Arc<CloneQueue>,
        pending: Arc<PendingCounter>,
        worker_cmd: WorkerCommand,
        fault_marker: Arc<dyn FaultMarker>,
        cfg: &Config,
    ) -> Self {
        Self {
            queue,
            pending,
            worker_cmd,
            fault_marker,
            env: cfg.vm_prefix.clone(),
            builder_proc: cfg.builder_proc.max(1),
            worker_timeout: Duration::from_secs(cfg.worker_timeout_secs),
        }
    }

    /// Pull tasks forever. The supervisor aborts this after queue drain.
    pub async fn run(self: Arc<Self>) {
        info!(parallelism = self.builder_proc, "builder pool online");
        let slots = Arc::new(Semaphore::new(self.builder_proc));
        loop {
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .expect("builder slot semaphore closed");
            let task = self.queue.get().await;
            let pool = self.clone();
            tokio::spawn(async move {
                pool.run_one(task).await;
                drop(permit);
            });
        }
    }

    async fn run_one(&self, task: CloneTask) {
        let init_name =
            naming::format_name(&self.env, VmClass::Init, &naming::job_suffix(task.job_id));

        match self.supervise_worker(&task).await {
            Some(result) if result.status == WorkerStatus::Ok => {
                info!(vm = %result.vm_name, "VM build succeeded");
            }
            Some(result) => {
                error!(
                    vm = %result.vm_name,
                    message = result.message.as_deref().unwrap_or("-"),
                    "VM build failed",
                );
                self.fault_marker.mark_fault(&init_name).await;
            }
            None => {
                error!(job = %task.job_id, "worker exited silently");
                self.fault_marker.mark_fault(&init_name).await;
            }
        }

        self.pending.dec();
        self.queue.task_done();
    }

    /// Spawn the worker, enforce the deadline, and read back at most one
    /// result. `None` covers every silent path: spawn failure, crash, kill
    /// on timeout, or garbage on stdout.
    async fn supervise_worker(&self, task: &CloneTask) -> Option<WorkerResult> {
        let mut child = match self.worker_cmd.command(task).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(job = %task.job_id, error = %e, "failed to spawn worker");
                return None;
            }
        };
        info!(
            job = %task.job_id,
            pid = child.id().unwrap_or(0),
            queued_for_ms = task.enqueued_at.elapsed().as_millis() as u64,
            "worker started",
        );

        let mut stdout = child.stdout.take().expect("worker stdout is piped");
        let reader = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout.read_to_string(&mut buf).await;
            buf
        });

        match timeout(self.worker_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                if !status.success() {
                    warn!(job = %task.job_id, status = %status, "worker exited non-zero");
                }
            }
            Ok(Err(e)) => {
                error!(job = %task.job_id, error = %e, "waiting on worker failed");
            }
            Err(_) => {
                warn!(
                    job = %task.job_id,
                    timeout_secs = self.worker_timeout.as_secs(),
                    "worker deadline exceeded, killing",
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        let output = timeout(RESULT_GRACE, reader).await.ok()?.ok()?;
        parse_worker_output(&output)
    }
}

/// Pick the result line out of a worker's stdout. Workers print exactly
/// one JSON line last; anything before it is stray output and skipped.
fn parse_worker_output(output: &str) -> Option<WorkerResult> {
    output
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str(line.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn test_config(builder_proc: usize, worker_timeout_secs: u64) -> Config {
        Config {
            min_ready_vm: 1,
            max_ready_vm: 4,
            batch_size: 2,
            check_interval_secs: 1,
            golden_name: "Golden".to_string(),
            pool_op_retries: 1,
            pool_op_backoff_secs: 0.001,
            ip_timeout_secs: 1,
            builder_proc,
            worker_timeout_secs,
            fault_vm_ttl_minutes: 60,
            vm_prefix: "Test".to_string(),
            vcenter_host: String::new(),
            vcenter_user: String::new(),
            vcenter_password: String::new(),
            vcenter_port: 443,
            nsx_host: String::new(),
            nsx_user: String::new(),
            nsx_password: String::new(),
            nsx_port: 22,
            nsx_switch_name: String::new(),
            nsx_cli_timeout_secs: 1,
            guest_bootstrap_cmd: None,
            app_tutorial_cmd: None,
        }
    }

    #[derive(Default)]
    struct RecordingMarker {
        marked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FaultMarker for Arc<RecordingMarker> {
        async fn mark_fault(&self, vm_name: &str) {
            self.marked.lock().unwrap().push(vm_name.to_string());
        }
    }

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::custom(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
    }

    async fn run_pool_until_drained(
        worker_cmd: WorkerCommand,
        worker_timeout_secs: u64,
        tasks: usize,
    ) -> (Arc<PendingCounter>, Arc<RecordingMarker>, Vec<CloneTask>) {
        let queue = Arc::new(CloneQueue::new());
        let pending = Arc::new(PendingCounter::new());
        let marker = Arc::new(RecordingMarker::default());
        let cfg = test_config(2, worker_timeout_secs);

        let mut put_tasks = Vec::new();
        for _ in 0..tasks {
            let task = CloneTask::new();
            pending.inc();
            queue.put(task);
            put_tasks.push(task);
        }

        let pool = Arc::new(BuilderPool::new(
            queue.clone(),
            pending.clone(),
            worker_cmd,
            Arc::new(marker.clone()),
            &cfg,
        ));
        let runner = tokio::spawn(pool.run());

        tokio::time::timeout(Duration::from_secs(20), queue.join())
            .await
            .expect("queue should drain");
        runner.abort();

        (pending, marker, put_tasks)
    }

    #[tokio::test]
    async fn test_ok_result_decrements_without_fault() {
        let cmd = sh(r#"printf '%s\n' '{"status":"ok","vm_name":"[Test] VM2login_00000000"}'"#);
        let (pending, marker, _) = run_pool_until_drained(cmd, 30, 1).await;
        assert_eq!(pending.value(), 0);
        assert!(marker.marked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_err_result_marks_init_name_faulty() {
        let cmd = sh(
            r#"printf '%s\n' '{"status":"err","vm_name":"[Test] VMError_00000000","message":"boom"}'"#,
        );
        let (pending, marker, tasks) = run_pool_until_drained(cmd, 30, 1).await;
        assert_eq!(pending.value(), 0);
        let marked = marker.marked.lock().unwrap();
        let expected =
            naming::format_name("Test", VmClass::Init, &naming::job_suffix(tasks[0].job_id));
        assert_eq!(*marked, vec![expected]);
    }

    #[tokio::test]
    async fn test_silent_exit_marks_init_name_faulty() {
        let (pending, marker, tasks) = run_pool_until_drained(sh("exit 0"), 30, 1).await;
        assert_eq!(pending.value(), 0);
        let marked = marker.marked.lock().unwrap();
        let expected =
            naming::format_name("Test", VmClass::Init, &naming::job_suffix(tasks[0].job_id));
        assert_eq!(*marked, vec![expected]);
    }

    #[tokio::test]
    async fn test_deadline_kill_still_decrements_and_marks() {
        // Worker hangs well past the 1 s deadline; the pool must kill it,
        // take the silent-exit path, and free the slot.
        let (pending, marker, _) = run_pool_until_drained(sh("sleep 60"), 1, 1).await;
        assert_eq!(pending.value(), 0);
        assert_eq!(marker.marked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_every_task_decrements_exactly_once() {
        let cmd = sh(r#"printf '%s\n' '{"status":"ok","vm_name":"[Test] VM2login_00000000"}'"#);
        let (pending, _, _) = run_pool_until_drained(cmd, 30, 5).await;
        assert_eq!(pending.value(), 0);
    }

    #[test]
    fn test_parse_worker_output_takes_last_json_line() {
        let output = "some stray logging\n{\"status\":\"ok\",\"vm_name\":\"a\"}\n";
        let result = parse_worker_output(output).unwrap();
        assert_eq!(result.status, WorkerStatus::Ok);
        assert_eq!(result.vm_name, "a");
    }

    #[test]
    fn test_parse_worker_output_empty_or_garbage() {
        assert!(parse_worker_output("").is_none());
        assert!(parse_worker_output("not json at all\n").is_none());
    }

    #[test]
    fn test_worker_command_appends_job_id() {
        let task = CloneTask::new();
        let cmd = WorkerCommand::custom(vec!["prog".to_string(), "worker".to_string()]);
        let built = cmd.command(&task);
        let args: Vec<_> = built.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["worker".to_string(), task.job_id.to_string()]);
    }
}
