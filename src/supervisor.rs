//! Backend process supervisor
//!
//! Owns the single child process running the compiled backend. Every
//! successful compile goes through [`BackendSupervisor::ensure_running`],
//! which either starts the process or stops the current one and starts a
//! fresh instance in its place. The old instance is always reaped before the
//! new one is spawned, so the backend port is never contended.

use crate::config::RuntimeConfig;
use crate::error::DevError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Value of `NODE_ENV` in the backend environment
pub const RUNTIME_MODE: &str = "development";

pub struct BackendSupervisor {
    runtime: RuntimeConfig,
    api_port: u16,
    child: Option<Child>,
}

impl BackendSupervisor {
    pub fn new(runtime: RuntimeConfig, api_port: u16) -> Self {
        Self {
            runtime,
            api_port,
            child: None,
        }
    }

    /// Process id of the running backend, if any
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Start the backend from `artifact`, or restart it if it is already running.
    pub async fn ensure_running(&mut self, artifact: &Path) -> Result<(), DevError> {
        if let Some(mut old) = self.child.take() {
            info!("Restarting dev runner");
            self.stop_child(&mut old).await;
        } else {
            info!("Starting dev runner");
        }

        let child = self.spawn(artifact)?;
        self.child = Some(child);
        Ok(())
    }

    /// Tear down the backend and produce the error that ends the session.
    pub async fn abort(&mut self, reason: &str) -> DevError {
        self.stop().await;
        error!("Killing dev runner");
        DevError::FatalCompile(reason.to_string())
    }

    /// Stop the backend if it is running
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            self.stop_child(&mut child).await;
        }
    }

    fn command(&self, artifact: &Path) -> Command {
        let mut cmd = Command::new(&self.runtime.command);
        cmd.args(&self.runtime.args);
        cmd.arg(artifact);
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        // Parent environment is inherited; configured extras come next and
        // the runtime mode and port always win
        for (key, value) in &self.runtime.env {
            cmd.env(key, value);
        }
        cmd.env("NODE_ENV", RUNTIME_MODE);
        cmd.env("PORT", self.api_port.to_string());
        cmd
    }

    fn spawn(&self, artifact: &Path) -> Result<Child, DevError> {
        let child = self
            .command(artifact)
            .spawn()
            .map_err(|source| DevError::Spawn {
                command: self.runtime.command.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or(0);
        info!(pid, artifact = %artifact.display(), port = self.api_port, "Backend process spawned");
        Ok(child)
    }

    async fn stop_child(&self, child: &mut Child) {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(?status, "Backend process had already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to poll backend process"),
        }

        let grace_period = self.runtime.shutdown_grace_period();

        if let Some(pid) = child.id() {
            debug!(pid, "Sending SIGTERM to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "Backend process exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for backend to exit");
            }
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Poll for `path` to exist with non-empty content.
    async fn wait_for_file(path: &Path, timeout: Duration) -> Option<String> {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                if !content.is_empty() {
                    return Some(content);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    fn write_artifact(dir: &Path, marker: &str) -> PathBuf {
        let path = dir.join("server-dev.sh");
        let script = format!(
            "echo \"{} $NODE_ENV $PORT\" > \"$OUT\"\nexec sleep 60\n",
            marker
        );
        std::fs::write(&path, script).unwrap();
        path
    }

    fn supervisor(out: &Path) -> BackendSupervisor {
        let mut env = HashMap::new();
        env.insert("OUT".to_string(), out.display().to_string());
        env.insert("NODE_ENV".to_string(), "production".to_string());
        let runtime = RuntimeConfig {
            command: "sh".to_string(),
            args: Vec::new(),
            env,
            shutdown_grace_period_secs: 2,
        };
        BackendSupervisor::new(runtime, 3901)
    }

    fn is_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[tokio::test]
    async fn test_first_compile_starts_backend_with_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let artifact = write_artifact(dir.path(), "v1");
        let mut sup = supervisor(&out);

        assert!(!sup.is_running());
        sup.ensure_running(&artifact).await.unwrap();
        assert!(sup.is_running());

        let content = wait_for_file(&out, Duration::from_secs(5)).await.unwrap();
        assert_eq!(content.trim(), "v1 development 3901");

        sup.stop().await;
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_restart_replaces_process_with_newest_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let artifact = write_artifact(dir.path(), "v1");
        let mut sup = supervisor(&out);

        sup.ensure_running(&artifact).await.unwrap();
        wait_for_file(&out, Duration::from_secs(5)).await.unwrap();
        let first_pid = sup.pid().unwrap();

        std::fs::remove_file(&out).unwrap();
        write_artifact(dir.path(), "v2");
        sup.ensure_running(&artifact).await.unwrap();

        let content = wait_for_file(&out, Duration::from_secs(5)).await.unwrap();
        assert!(content.starts_with("v2"));

        let second_pid = sup.pid().unwrap();
        assert_ne!(first_pid, second_pid);
        assert!(!is_alive(first_pid));
        assert!(is_alive(second_pid));

        sup.stop().await;
        assert!(!is_alive(second_pid));
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_for_port(port: u16, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Artifact that listens on `$PORT` and records its pid once bound.
    /// A second listener on the same port fails to bind.
    const LISTENING_ARTIFACT: &str = r#"exec python3 -c '
import os, socket, time
s = socket.socket()
s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)
s.bind(("127.0.0.1", int(os.environ["PORT"])))
s.listen(16)
with open(os.environ["OUT"], "w") as f:
    f.write("bound %d" % os.getpid())
time.sleep(60)
'
"#;

    #[tokio::test]
    async fn test_restarted_backend_binds_port_again() {
        if std::process::Command::new("python3").arg("--version").output().is_err() {
            eprintln!("python3 not available, skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let artifact = dir.path().join("listen.sh");
        std::fs::write(&artifact, LISTENING_ARTIFACT).unwrap();

        let port = free_port();
        let mut sup = supervisor(&out);
        sup.api_port = port;

        for round in 0..3 {
            let _ = std::fs::remove_file(&out);
            sup.ensure_running(&artifact).await.unwrap();
            let pid = sup.pid().unwrap();

            let content = wait_for_file(&out, Duration::from_secs(10))
                .await
                .unwrap_or_else(|| panic!("instance {} never bound port {}", round, port));
            assert_eq!(content, format!("bound {}", pid));
            assert!(wait_for_port(port, Duration::from_secs(5)).await);
        }

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_restart_is_unconditional() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let artifact = write_artifact(dir.path(), "same");
        let mut sup = supervisor(&out);

        let mut pids = Vec::new();
        for _ in 0..3 {
            sup.ensure_running(&artifact).await.unwrap();
            pids.push(sup.pid().unwrap());
        }
        assert_ne!(pids[0], pids[1]);
        assert_ne!(pids[1], pids[2]);

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_backend_exited_on_its_own() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("crash.sh");
        std::fs::write(&artifact, "exit 3\n").unwrap();
        let mut sup = supervisor(&dir.path().join("out.txt"));

        sup.ensure_running(&artifact).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        sup.ensure_running(&artifact).await.unwrap();
        assert!(sup.is_running());

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_abort_kills_backend_and_reports_reason() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let artifact = write_artifact(dir.path(), "v1");
        let mut sup = supervisor(&out);

        sup.ensure_running(&artifact).await.unwrap();
        let pid = sup.pid().unwrap();

        let err = sup.abort(crate::error::FATAL_COMPILE_REASON).await;
        assert!(err.is_fatal_compile());
        assert_eq!(err.to_string(), "Fatal error while compiling.");
        assert!(!sup.is_running());
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_abort_without_backend() {
        let mut sup = supervisor(Path::new("/dev/null"));
        let err = sup.abort("reason").await;
        assert_eq!(err.to_string(), "reason");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runtime = RuntimeConfig {
            command: "definitely-not-a-runtime".to_string(),
            ..RuntimeConfig::default()
        };
        let mut sup = BackendSupervisor::new(runtime, 3902);

        let err = sup.ensure_running(Path::new("server.js")).await.unwrap_err();
        assert!(matches!(err, DevError::Spawn { .. }));
        assert!(!sup.is_running());
    }
}
