use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Filename the development backend bundle is always written to
pub const BACKEND_ARTIFACT_FILENAME: &str = "server-dev.js";
/// Default live-reload client entry injected into the frontend bundle
pub const LIVE_RELOAD_CLIENT_ENTRY: &str = "webpack-dev-server/client";
/// Hot module replacement runtime entry injected into the frontend bundle
pub const HOT_RUNTIME_ENTRY: &str = "webpack/hot/only-dev-server";
/// Plugin appended to the frontend plugin set
pub const HOT_MODULE_REPLACEMENT_PLUGIN: &str = "HotModuleReplacementPlugin";
/// Source map mode used by both development variants
pub const DEVELOPMENT_DEVTOOL: &str = "sourcemap";

/// Global configuration for the runner
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Ports, hosts and process-wide behavior
    #[serde(default)]
    pub server: ServerConfig,

    /// How the compiled backend is launched
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Base build configuration of the server-side bundle
    #[serde(default = "default_backend_build")]
    pub backend: BuildConfig,

    /// Base build configuration of the browser bundle
    #[serde(default = "default_frontend_build")]
    pub frontend: BuildConfig,

    /// What to print after each frontend compilation
    #[serde(default)]
    pub stats: StatsOptions,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Scheme and host shared by the dev server and the backend (default: http://localhost)
    #[serde(default = "default_server_base")]
    pub server_base: String,

    /// Port the frontend dev server listens on (default: 3000)
    #[serde(default = "default_client_port")]
    pub client_port: u16,

    /// Port the backend process is told to bind (default: 3001)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Bind address of the dev server listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Exit on a fatal backend compile instead of logging and continuing
    #[serde(default)]
    pub strict: bool,

    /// Directory for derived build descriptors (default: .devrunner)
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Quiet period after a file change before rebuilding, in milliseconds
    #[serde(default = "default_watch_debounce")]
    pub watch_debounce_ms: u64,

    /// Module prepended to the frontend bundle to receive reload notifications.
    /// `webpack-dev-server/client` expects a webpack-dev-server socket; point this
    /// at `./.devrunner/live-reload-client.js` to use the dev server's own
    /// event stream instead.
    #[serde(default = "default_live_reload_client")]
    pub live_reload_client: String,
}

impl ServerConfig {
    /// Origin of the frontend dev server, e.g. `http://localhost:3000`
    pub fn client_origin(&self) -> String {
        format!("{}:{}", self.server_base.trim_end_matches('/'), self.client_port)
    }

    /// Origin of the backend process, e.g. `http://localhost:3001`
    pub fn api_origin(&self) -> String {
        format!("{}:{}", self.server_base.trim_end_matches('/'), self.api_port)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_base: default_server_base(),
            client_port: default_client_port(),
            api_port: default_api_port(),
            bind: default_bind_address(),
            strict: false,
            state_dir: default_state_dir(),
            watch_debounce_ms: default_watch_debounce(),
            live_reload_client: default_live_reload_client(),
        }
    }
}

/// Launch parameters of the backend child process
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Interpreter the artifact is handed to (default: node)
    #[serde(default = "default_runtime_command")]
    pub command: String,

    /// Arguments placed before the artifact path
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables. `NODE_ENV` and `PORT` are always overridden.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Grace period in seconds between SIGTERM and SIGKILL when restarting
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl RuntimeConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_runtime_command(),
            args: Vec::new(),
            env: HashMap::new(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

/// Where the bundler writes its output
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OutputConfig {
    /// Output directory
    #[serde(default = "default_output_path")]
    pub path: String,

    /// Name of the main bundle
    #[serde(default = "default_output_filename")]
    pub filename: String,

    /// URL prefix assets are requested under
    #[serde(rename = "publicPath", alias = "public_path", skip_serializing_if = "Option::is_none")]
    pub public_path: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            filename: default_output_filename(),
            public_path: None,
        }
    }
}

/// Build descriptor handed to the bundler.
///
/// `command` and `watch_paths` belong to the runner; everything else is
/// serialized into the JSON file the bundler reads.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BuildConfig {
    /// Bundler invocation. `{config}` is replaced by the descriptor path.
    #[serde(default = "default_bundler_command", skip_serializing)]
    pub command: String,

    /// Directories whose changes trigger a rebuild
    #[serde(default = "default_watch_paths", skip_serializing)]
    pub watch_paths: Vec<String>,

    #[serde(default)]
    pub entry: Vec<String>,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub plugins: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devtool: Option<String>,

    /// Bundler target environment, e.g. `node` or `web`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default)]
    pub debug: bool,

    /// Watch mode is driven by the runner, so this never reaches the bundler
    #[serde(default, skip_serializing)]
    pub watch: bool,

    #[serde(default)]
    pub inline: bool,
}

impl BuildConfig {
    /// Derive the development variant of a server-side build: fixed artifact
    /// name, watch mode and source maps.
    pub fn backend_development(&self) -> Self {
        Self {
            output: OutputConfig {
                filename: BACKEND_ARTIFACT_FILENAME.to_string(),
                ..self.output.clone()
            },
            debug: true,
            watch: true,
            devtool: Some(DEVELOPMENT_DEVTOOL.to_string()),
            inline: true,
            ..self.clone()
        }
    }

    /// Derive the development variant of a browser build served from
    /// `client_origin`, with `client_entry` as the live-reload client.
    pub fn frontend_development(&self, client_origin: &str, client_entry: &str) -> Self {
        let mut entry = vec![
            format!("{}?{}", client_entry, client_origin),
            HOT_RUNTIME_ENTRY.to_string(),
        ];
        entry.extend(self.entry.iter().cloned());

        let mut plugins = self.plugins.clone();
        plugins.push(HOT_MODULE_REPLACEMENT_PLUGIN.to_string());

        Self {
            entry,
            plugins,
            output: OutputConfig {
                public_path: Some(format!("{}/", client_origin)),
                ..self.output.clone()
            },
            watch: true,
            devtool: Some(DEVELOPMENT_DEVTOOL.to_string()),
            inline: true,
            ..self.clone()
        }
    }

    /// Path of the main bundle, e.g. `dist/server-dev.js`
    pub fn artifact_path(&self) -> PathBuf {
        Path::new(&self.output.path).join(&self.output.filename)
    }

    pub fn validate(&self, name: &str) -> Result<(), String> {
        match shell_words::split(&self.command) {
            Ok(words) if words.is_empty() => {
                return Err(format!("{} build: 'command' must not be empty", name));
            }
            Ok(_) => {}
            Err(e) => return Err(format!("{} build: invalid 'command': {}", name, e)),
        }
        if self.output.path.is_empty() || self.output.filename.is_empty() {
            return Err(format!("{} build: output path and filename are required", name));
        }
        Ok(())
    }
}

/// Sections of the compilation statistics printed after a frontend build
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StatsOptions {
    #[serde(default = "default_true")]
    pub assets: bool,
    #[serde(default = "default_true")]
    pub colors: bool,
    #[serde(default)]
    pub version: bool,
    #[serde(default = "default_true")]
    pub hash: bool,
    #[serde(default = "default_true")]
    pub timings: bool,
    #[serde(default)]
    pub chunks: bool,
    #[serde(default)]
    pub chunk_modules: bool,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            assets: true,
            colors: true,
            version: false,
            hash: true,
            timings: true,
            chunks: false,
            chunk_modules: false,
        }
    }
}

fn default_server_base() -> String {
    "http://localhost".to_string()
}

fn default_client_port() -> u16 {
    3000
}

fn default_api_port() -> u16 {
    3001
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_state_dir() -> String {
    ".devrunner".to_string()
}

fn default_watch_debounce() -> u64 {
    100
}

fn default_runtime_command() -> String {
    "node".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_output_path() -> String {
    "dist".to_string()
}

fn default_output_filename() -> String {
    "bundle.js".to_string()
}

fn default_bundler_command() -> String {
    "node {adapter} {config}".to_string()
}

fn default_live_reload_client() -> String {
    LIVE_RELOAD_CLIENT_ENTRY.to_string()
}

fn default_watch_paths() -> Vec<String> {
    vec!["src".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_backend_build() -> BuildConfig {
    BuildConfig {
        command: default_bundler_command(),
        watch_paths: default_watch_paths(),
        entry: vec!["./src/server/index.js".to_string()],
        output: OutputConfig {
            path: default_output_path(),
            filename: "server.js".to_string(),
            public_path: None,
        },
        plugins: Vec::new(),
        devtool: None,
        target: Some("node".to_string()),
        debug: false,
        watch: false,
        inline: false,
    }
}

fn default_frontend_build() -> BuildConfig {
    BuildConfig {
        command: default_bundler_command(),
        watch_paths: default_watch_paths(),
        entry: vec!["./src/client/index.js".to_string()],
        output: OutputConfig {
            path: "dist/public".to_string(),
            filename: default_output_filename(),
            public_path: None,
        },
        plugins: Vec::new(),
        devtool: None,
        target: Some("web".to_string()),
        debug: false,
        watch: false,
        inline: false,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            runtime: RuntimeConfig::default(),
            backend: default_backend_build(),
            frontend: default_frontend_build(),
            stats: StatsOptions::default(),
        }
    }
}

impl Config {
    /// Development variant of the frontend build served by the dev server
    pub fn frontend_development(&self) -> BuildConfig {
        self.frontend
            .frontend_development(&self.server.client_origin(), &self.server.live_reload_client)
    }

    /// Directories the runner or the bundlers write to. File changes below
    /// them never trigger a rebuild.
    pub fn generated_dirs(&self) -> Vec<PathBuf> {
        vec![
            PathBuf::from(&self.server.state_dir),
            PathBuf::from(&self.backend.output.path),
            PathBuf::from(&self.frontend.output.path),
        ]
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.client_port == 0 || self.server.api_port == 0 {
            anyhow::bail!("client_port and api_port must be non-zero");
        }
        if self.server.client_port == self.server.api_port {
            anyhow::bail!(
                "client_port and api_port must differ (both are {})",
                self.server.client_port
            );
        }
        if !self.server.server_base.starts_with("http://") {
            anyhow::bail!("server_base must be an http:// URL, got '{}'", self.server.server_base);
        }
        if self.server.live_reload_client.is_empty() {
            anyhow::bail!("live_reload_client must not be empty");
        }
        if self.runtime.command.is_empty() {
            anyhow::bail!("runtime command must not be empty");
        }
        self.backend.validate("backend").map_err(anyhow::Error::msg)?;
        self.frontend.validate("frontend").map_err(anyhow::Error::msg)?;
        Ok(())
    }
}
