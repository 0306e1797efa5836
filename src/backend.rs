//! Backend build step
//!
//! Consumes backend compile outcomes in order and drives the supervisor:
//! errors end the session (or are logged, outside strict mode), warnings are
//! logged, and every successful compile starts or restarts the backend.

use crate::compiler::{watch, CommandCompiler, CompileOutcome, WatchOptions};
use crate::config::Config;
use crate::error::{DevError, FATAL_COMPILE_REASON};
use crate::supervisor::BackendSupervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch as watch_channel};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct BackendBuild {
    supervisor: BackendSupervisor,
    artifact: PathBuf,
    strict: bool,
}

impl BackendBuild {
    pub fn new(supervisor: BackendSupervisor, artifact: impl Into<PathBuf>, strict: bool) -> Self {
        Self {
            supervisor,
            artifact: artifact.into(),
            strict,
        }
    }

    /// Derive the development build, start watching it and spawn the build loop.
    pub fn start(
        config: &Config,
        shutdown_rx: watch_channel::Receiver<bool>,
    ) -> Result<JoinHandle<Result<(), DevError>>, DevError> {
        let build = config.backend.backend_development();
        let artifact = build.artifact_path();
        let compiler = Arc::new(CommandCompiler::new("backend", &config.server.state_dir));
        let options = WatchOptions::for_build(&build, config.server.watch_debounce())
            .ignoring(config.generated_dirs());

        info!(artifact = %artifact.display(), entry = ?build.entry, "Compiling backend in watch mode");
        let outcomes = watch(compiler, build, options)?;

        let supervisor = BackendSupervisor::new(config.runtime.clone(), config.server.api_port);
        let backend = Self::new(supervisor, artifact, config.server.strict);
        Ok(tokio::spawn(backend.run(outcomes, shutdown_rx)))
    }

    pub fn supervisor(&self) -> &BackendSupervisor {
        &self.supervisor
    }

    /// Handle one compilation outcome.
    pub async fn on_compile(&mut self, outcome: CompileOutcome) -> Result<(), DevError> {
        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Backend bundler failed");
                return Err(self.supervisor.abort(FATAL_COMPILE_REASON).await);
            }
        };

        if report.has_errors() {
            for diagnostic in &report.errors {
                error!("{}", diagnostic);
            }
            return Err(self.supervisor.abort(FATAL_COMPILE_REASON).await);
        }

        for diagnostic in &report.warnings {
            warn!("{}", diagnostic);
        }

        debug!(hash = ?report.hash, time_ms = ?report.time, "Backend compiled");
        self.supervisor.ensure_running(&self.artifact).await
    }

    /// Process outcomes until the watch ends or shutdown is signalled.
    pub async fn run(
        mut self,
        mut outcomes: mpsc::Receiver<CompileOutcome>,
        mut shutdown_rx: watch_channel::Receiver<bool>,
    ) -> Result<(), DevError> {
        loop {
            tokio::select! {
                outcome = outcomes.recv() => {
                    let Some(outcome) = outcome else {
                        debug!("Backend watch ended");
                        break;
                    };
                    if let Err(e) = self.on_compile(outcome).await {
                        if self.strict {
                            self.supervisor.stop().await;
                            return Err(e);
                        }
                        error!(error = %e, "Backend build error, waiting for the next change");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.supervisor.stop().await;
        Ok(())
    }
}
