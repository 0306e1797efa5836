//! Bundler invocation and watch mode
//!
//! The bundler is an external command. Each compilation writes the derived
//! [`BuildConfig`] to a JSON descriptor, runs the command, and parses the
//! JSON statistics it prints on stdout into a [`CompileReport`]. Each call is
//! a single compilation; watch mode belongs to the runner.
//!
//! The default command runs the bundled webpack adapter
//! (`node {adapter} {config}`), which turns the descriptor into a webpack
//! configuration and prints `stats.toJson()`.
//!
//! [`watch`] drives a [`Compiler`] from file-system events. Rebuilds are
//! serialized: a new compilation starts only after the previous outcome has
//! been handed to the consumer.

use crate::config::{BuildConfig, StatsOptions};
use crate::error::DevError;
use colored::Colorize;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::fmt::Write as _;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Placeholder in the bundler command replaced by the descriptor path
pub const CONFIG_PLACEHOLDER: &str = "{config}";
/// Placeholder in the bundler command replaced by the webpack adapter path
pub const ADAPTER_PLACEHOLDER: &str = "{adapter}";
/// Environment variable carrying the descriptor path to the bundler
pub const BUILD_CONFIG_ENV: &str = "DEVRUNNER_BUILD_CONFIG";
/// File the webpack adapter is written to inside the state directory
pub const WEBPACK_ADAPTER_FILENAME: &str = "webpack-adapter.js";

const WEBPACK_ADAPTER: &str = include_str!("../assets/webpack-adapter.js");

/// A compiler diagnostic: plain text or an object with a message
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Diagnostic {
    Text(String),
    Detailed {
        message: String,
        #[serde(default, rename = "moduleName")]
        module_name: Option<String>,
    },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::Text(text) => write!(f, "{}", text),
            Diagnostic::Detailed {
                message,
                module_name: Some(module),
            } => write!(f, "{}\n{}", module, message),
            Diagnostic::Detailed { message, .. } => write!(f, "{}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssetStats {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModuleStats {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChunkStats {
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modules: Vec<ModuleStats>,
}

/// Result of one compilation cycle
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompileReport {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Compilation time in milliseconds
    #[serde(default)]
    pub time: Option<u64>,
    #[serde(default)]
    pub assets: Vec<AssetStats>,
    #[serde(default)]
    pub chunks: Vec<ChunkStats>,
    #[serde(default)]
    pub errors: Vec<Diagnostic>,
    #[serde(default)]
    pub warnings: Vec<Diagnostic>,
}

impl CompileReport {
    /// Parse bundler stdout. Leading non-JSON noise is skipped.
    pub fn from_stdout(stdout: &str) -> Result<Self, serde_json::Error> {
        let start = stdout.find('{').unwrap_or(0);
        serde_json::from_str(&stdout[start..])
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Render the statistics sections enabled in `options`
    pub fn render(&self, options: &StatsOptions) -> String {
        let mut out = String::new();
        let colors = options.colors;

        if options.hash {
            if let Some(ref hash) = self.hash {
                let _ = writeln!(out, "Hash: {}", paint(colors, hash, |t| t.bold()));
            }
        }
        if options.version {
            if let Some(ref version) = self.version {
                let _ = writeln!(out, "Version: {}", paint(colors, version, |t| t.bold()));
            }
        }
        if options.timings {
            if let Some(time) = self.time {
                let _ = writeln!(out, "Time: {}ms", paint(colors, &time.to_string(), |t| t.bold()));
            }
        }
        if options.assets && !self.assets.is_empty() {
            let width = self
                .assets
                .iter()
                .map(|a| a.name.len())
                .max()
                .unwrap_or(0)
                .max("Asset".len());
            let _ = writeln!(out, "{:>width$}  Size", "Asset", width = width);
            for asset in &self.assets {
                let padded = format!("{:>width$}", asset.name, width = width);
                let _ = writeln!(
                    out,
                    "{}  {}",
                    paint(colors, &padded, |t| t.green()),
                    format_size(asset.size)
                );
            }
        }
        if options.chunks {
            for chunk in &self.chunks {
                let id = match chunk.id {
                    serde_json::Value::String(ref s) => s.clone(),
                    ref other => other.to_string(),
                };
                let _ = writeln!(
                    out,
                    "chunk {{{}}} {} {}",
                    paint(colors, &id, |t| t.yellow()),
                    chunk.names.join(", "),
                    format_size(chunk.size)
                );
                if options.chunk_modules {
                    for module in &chunk.modules {
                        let _ = writeln!(out, "    {}", module.name);
                    }
                }
            }
        }

        out.trim_end().to_string()
    }
}

/// Style `text` when colors are on. `colored` still drops the styling when
/// the terminal does not support it.
fn paint(colors: bool, text: &str, style: fn(&str) -> colored::ColoredString) -> String {
    if colors {
        style(text).to_string()
    } else {
        text.to_string()
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KiB", "MiB", "GiB"];
    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

/// The bundler itself failed, as opposed to reporting compile errors
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Bundler command is empty")]
    EmptyCommand,

    #[error("Invalid bundler command: {0}")]
    InvalidCommand(String),

    #[error("Failed to write {path}: {source}")]
    Descriptor {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run bundler '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bundler exited with {status} without reporting statistics")]
    Failed { status: String },

    #[error("Bundler printed invalid statistics: {0}")]
    InvalidStats(#[from] serde_json::Error),
}

/// Something that turns a build descriptor into a compilation result
pub trait Compiler: Send + Sync + 'static {
    fn compile(
        &self,
        config: &BuildConfig,
    ) -> impl Future<Output = Result<CompileReport, CompileError>> + Send;
}

/// Runs the configured bundler command
pub struct CommandCompiler {
    /// Bundle name, used for the descriptor filename
    name: String,
    state_dir: PathBuf,
}

impl CommandCompiler {
    pub fn new(name: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json", self.name))
    }

    pub fn adapter_path(&self) -> PathBuf {
        self.state_dir.join(WEBPACK_ADAPTER_FILENAME)
    }

    async fn write_state_file(&self, path: &Path, content: &[u8]) -> Result<(), CompileError> {
        let to_error = |source| CompileError::Descriptor {
            path: path.display().to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.state_dir).await.map_err(to_error)?;
        tokio::fs::write(path, content).await.map_err(to_error)
    }

    async fn write_descriptor(&self, config: &BuildConfig) -> Result<PathBuf, CompileError> {
        let path = self.descriptor_path();
        let json = serde_json::to_vec_pretty(config)?;
        self.write_state_file(&path, &json).await?;
        Ok(path)
    }
}

impl Compiler for CommandCompiler {
    async fn compile(&self, config: &BuildConfig) -> Result<CompileReport, CompileError> {
        let descriptor = self.write_descriptor(config).await?;
        let descriptor_str = descriptor.to_string_lossy();

        let adapter = self.adapter_path();
        if config.command.contains(ADAPTER_PLACEHOLDER) {
            self.write_state_file(&adapter, WEBPACK_ADAPTER.as_bytes()).await?;
        }
        let adapter_str = adapter.to_string_lossy();

        let words = shell_words::split(&config.command)
            .map_err(|e| CompileError::InvalidCommand(e.to_string()))?;
        let mut words = words.into_iter().map(|w| {
            w.replace(CONFIG_PLACEHOLDER, &descriptor_str)
                .replace(ADAPTER_PLACEHOLDER, &adapter_str)
        });
        let program = words.next().ok_or(CompileError::EmptyCommand)?;

        debug!(bundle = %self.name, command = %config.command, descriptor = %descriptor.display(), "Running bundler");

        let output = Command::new(&program)
            .args(words)
            .env(BUILD_CONFIG_ENV, descriptor.as_os_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|source| CompileError::Spawn {
                command: program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match CompileReport::from_stdout(&stdout) {
            Ok(report) => Ok(report),
            Err(_) if !output.status.success() => Err(CompileError::Failed {
                status: output.status.to_string(),
            }),
            Err(e) => Err(CompileError::InvalidStats(e)),
        }
    }
}

pub type CompileOutcome = Result<CompileReport, CompileError>;

/// What to watch and how long to wait for changes to settle
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub paths: Vec<PathBuf>,
    /// Changes below these directories are ignored (bundler output)
    pub ignore: Vec<PathBuf>,
    pub debounce: Duration,
}

impl WatchOptions {
    /// Watch the configured source directories and ignore the output directory
    pub fn for_build(config: &BuildConfig, debounce: Duration) -> Self {
        Self {
            paths: config.watch_paths.iter().map(PathBuf::from).collect(),
            ignore: vec![PathBuf::from(&config.output.path)],
            debounce,
        }
    }

    /// Also ignore changes below `dirs`
    pub fn ignoring(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        for dir in dirs {
            if !self.ignore.contains(&dir) {
                self.ignore.push(dir);
            }
        }
        self
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn is_relevant(event: &Event, ignore: &[PathBuf]) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| !ignore.iter().any(|dir| p.starts_with(dir)))
}

/// Compile once, then again after every settled batch of file changes.
///
/// Outcomes are delivered in order over the returned channel. The watch ends
/// when the receiver is dropped.
pub fn watch<C: Compiler>(
    compiler: Arc<C>,
    config: BuildConfig,
    options: WatchOptions,
) -> Result<mpsc::Receiver<CompileOutcome>, DevError> {
    let ignore: Vec<PathBuf> = options.ignore.iter().map(|p| absolutize(p)).collect();
    let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<()>();

    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) if is_relevant(&event, &ignore) => {
                let _ = trigger_tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "File watcher error"),
        })
        .map_err(|source| DevError::Watch {
            path: options.paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "),
            source,
        })?;

    for path in &options.paths {
        let path = absolutize(path);
        watcher
            .watch(&path, RecursiveMode::Recursive)
            .map_err(|source| DevError::Watch {
                path: path.display().to_string(),
                source,
            })?;
        debug!(path = %path.display(), "Watching for changes");
    }

    let (results_tx, results_rx) = mpsc::channel(1);
    let debounce = options.debounce;

    tokio::spawn(async move {
        // Keep the watcher alive for as long as this task runs
        let _watcher = watcher;

        loop {
            let outcome = compiler.compile(&config).await;
            if results_tx.send(outcome).await.is_err() {
                debug!("Compile consumer gone, stopping watch");
                return;
            }

            if trigger_rx.recv().await.is_none() {
                return;
            }
            // Wait until changes settle
            loop {
                match tokio::time::timeout(debounce, trigger_rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            debug!("Source change detected, recompiling");
        }
    });

    Ok(results_rx)
}
