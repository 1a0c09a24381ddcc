use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use gnomehat_domain::entities::{ExitInfo, Job};
use gnomehat_errors::{SchedulerError, SchedulerResult};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// 日志文件名，每个任务一个目录
pub const LOG_FILE_NAME: &str = "stdout.txt";

/// 执行器边界：核心只把命令交给执行器，拿回退出信息，不解释命令内容
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn spawn(&self, job: &Job, worker_id: &str) -> SchedulerResult<Box<dyn RunningJob>>;

    fn name(&self) -> &str;
}

/// 正在运行的任务进程
#[async_trait]
pub trait RunningJob: Send {
    /// 等待进程退出。必须可取消：在 `select!` 中被丢弃后可以再次调用
    async fn wait(&mut self) -> SchedulerResult<ExitInfo>;

    /// 终止进程并回收
    async fn terminate(&mut self) -> SchedulerResult<()>;

    fn log_path(&self) -> Option<&str>;
}

/// 通过 `sh -c` 执行任务命令，stdout/stderr 写入 `<log_dir>/<job_id>/stdout.txt`
///
/// Unix 下每个任务在独立的进程组中运行，终止或丢弃时整组发送 SIGKILL，
/// 命令派生的后台进程不会残留。
pub struct ShellRunner {
    log_dir: PathBuf,
}

impl ShellRunner {
    pub fn new<P: Into<PathBuf>>(log_dir: P) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    pub fn log_path_for(&self, job_id: i64) -> PathBuf {
        self.log_dir.join(job_id.to_string()).join(LOG_FILE_NAME)
    }

    async fn open_log(path: &Path) -> SchedulerResult<(std::fs::File, std::fs::File)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SchedulerError::runner_failure(format!("创建日志目录失败: {e}")))?;
        }

        let stdout = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| SchedulerError::runner_failure(format!("打开日志文件失败: {e}")))?
            .into_std()
            .await;
        let stderr = stdout
            .try_clone()
            .map_err(|e| SchedulerError::runner_failure(format!("复制日志句柄失败: {e}")))?;

        Ok((stdout, stderr))
    }
}

#[async_trait]
impl JobRunner for ShellRunner {
    async fn spawn(&self, job: &Job, worker_id: &str) -> SchedulerResult<Box<dyn RunningJob>> {
        let log_path = self.log_path_for(job.id);
        let (stdout, stderr) = Self::open_log(&log_path).await?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&job.command)
            .env("GNOMEHAT_JOB_ID", job.id.to_string())
            .env("GNOMEHAT_WORKER_ID", worker_id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = &job.metadata.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| SchedulerError::runner_failure(format!("启动Shell命令失败: {e}")))?;

        info!(
            "启动任务 {} (pid: {:?})，日志: {}",
            job.id,
            child.id(),
            log_path.display()
        );

        // process_group(0) 使组 ID 等于子进程 pid
        let pgid = child.id().map(|pid| pid as i32);

        Ok(Box::new(ShellProcess {
            job_id: job.id,
            child,
            pgid,
            group_killed: false,
            log_path: log_path.to_string_lossy().into_owned(),
        }))
    }

    fn name(&self) -> &str {
        "shell"
    }
}

struct ShellProcess {
    job_id: i64,
    child: Child,
    pgid: Option<i32>,
    group_killed: bool,
    log_path: String,
}

impl ShellProcess {
    /// 向整个进程组发送 SIGKILL，只发送一次
    #[cfg(unix)]
    fn kill_group(&mut self) {
        if self.group_killed {
            return;
        }
        self.group_killed = true;

        if let Some(pgid) = self.pgid {
            // SAFETY: killpg 只发送信号，不访问任何内存
            let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!("终止任务 {} 的进程组 {} 失败: {}", self.job_id, pgid, err);
                }
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) {
        self.group_killed = true;
    }

    fn exit_info(&self, status: std::process::ExitStatus) -> ExitInfo {
        let info = ExitInfo::from_exit_code(status.code(), Some(self.log_path.clone()));

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return info.with_message(format!("terminated by signal {signal}"));
            }
        }

        info
    }
}

#[async_trait]
impl RunningJob for ShellProcess {
    async fn wait(&mut self) -> SchedulerResult<ExitInfo> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| SchedulerError::runner_failure(format!("等待进程退出失败: {e}")))?;
        debug!("任务 {} 进程退出: {}", self.job_id, status);
        Ok(self.exit_info(status))
    }

    async fn terminate(&mut self) -> SchedulerResult<()> {
        // Shell 已退出时组内可能还有后台进程
        let exited = matches!(self.child.try_wait(), Ok(Some(_)));
        if !exited {
            warn!("终止任务 {} 的进程组 (pid: {:?})", self.job_id, self.child.id());
        }
        self.kill_group();

        if exited {
            return Ok(());
        }
        // kill 之后等待回收，不留下僵尸进程
        self.child
            .kill()
            .await
            .map_err(|e| SchedulerError::runner_failure(format!("终止进程失败: {e}")))
    }

    fn log_path(&self) -> Option<&str> {
        Some(&self.log_path)
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        self.kill_group();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnomehat_domain::entities::{JobMetadata, NewJob};
    use std::time::Duration;

    fn job(id: i64, command: &str) -> Job {
        NewJob::new(command, JobMetadata::default()).into_job(id)
    }

    #[tokio::test]
    async fn test_shell_runner_success_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());

        let mut running = runner
            .spawn(&job(1, "echo hello; echo oops >&2"), "worker-1")
            .await
            .unwrap();
        let exit = running.wait().await.unwrap();

        assert_eq!(exit.exit_code, Some(0));
        let log_path = runner.log_path_for(1);
        assert_eq!(exit.log_path.as_deref(), log_path.to_str());
        let log = std::fs::read_to_string(log_path).unwrap();
        assert!(log.contains("hello"));
        assert!(log.contains("oops"));
    }

    #[tokio::test]
    async fn test_shell_runner_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());

        let mut running = runner.spawn(&job(2, "exit 3"), "worker-1").await.unwrap();
        assert_eq!(running.wait().await.unwrap().exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_shell_runner_environment_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());

        let mut job = job(7, "echo $GNOMEHAT_JOB_ID $GNOMEHAT_WORKER_ID; pwd");
        job.metadata.working_dir = Some(workdir.path().to_string_lossy().into_owned());

        let mut running = runner.spawn(&job, "gpu-box").await.unwrap();
        running.wait().await.unwrap();

        let log = std::fs::read_to_string(runner.log_path_for(7)).unwrap();
        assert!(log.contains("7 gpu-box"));
        let canonical = workdir.path().canonicalize().unwrap();
        assert!(log.contains(canonical.file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_shell_runner_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());

        let mut running = runner.spawn(&job(3, "sleep 30"), "worker-1").await.unwrap();

        let wait = tokio::time::timeout(Duration::from_millis(50), running.wait()).await;
        assert!(wait.is_err());

        running.terminate().await.unwrap();
        let exit = running.wait().await.unwrap();
        assert_ne!(exit.exit_code, Some(0));
    }

    /// 进程不存在，或已退出只剩僵尸
    #[cfg(target_os = "linux")]
    fn process_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    async fn spawn_with_background_child(
        runner: &ShellRunner,
        pid_file: &Path,
    ) -> (Box<dyn RunningJob>, i32) {
        let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let running = runner.spawn(&job(4, &command), "worker-1").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(raw) = std::fs::read_to_string(pid_file) {
                if let Ok(pid) = raw.trim().parse::<i32>() {
                    return (running, pid);
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "后台进程未启动");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pid: i32) -> bool {
        for _ in 0..200 {
            if process_gone(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path().join("logs"));
        let pid_file = dir.path().join("child.pid");

        let (mut running, child_pid) = spawn_with_background_child(&runner, &pid_file).await;
        assert!(!process_gone(child_pid));

        running.terminate().await.unwrap();
        assert!(wait_until_gone(child_pid).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_drop_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path().join("logs"));
        let pid_file = dir.path().join("child.pid");

        let (running, child_pid) = spawn_with_background_child(&runner, &pid_file).await;
        drop(running);

        assert!(wait_until_gone(child_pid).await);
    }
}
