//! Frontend dev server
//!
//! Compiles the frontend bundle in watch mode, serves the emitted assets,
//! pushes live-reload events to connected browsers, and hands every other
//! request to the [`BackendProxy`].
//!
//! The browser half of the event stream is served at [`CLIENT_PATH`] and
//! written to `<state_dir>/live-reload-client.js` so it can also be used as
//! the bundle's live-reload entry.

use crate::compiler::{watch, CommandCompiler, CompileOutcome, CompileReport, WatchOptions};
use crate::config::{Config, StatsOptions};
use crate::error::{json_error_response, DevError, ProxyErrorCode};
use crate::proxy::BackendProxy;
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch as watch_channel};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Server-sent-events endpoint the live-reload client subscribes to
pub const EVENTS_PATH: &str = "/__devrunner/events";
/// Browser script that subscribes to [`EVENTS_PATH`]
pub const CLIENT_PATH: &str = "/__devrunner/client.js";
/// Name of the client script inside the state directory
pub const CLIENT_FILENAME: &str = "live-reload-client.js";
/// Interval of the comment lines that keep idle event streams open
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

const LIVE_RELOAD_CLIENT: &str = include_str!("../assets/live-reload-client.js");

/// Message pushed to browsers after a frontend compilation
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadEvent {
    Hash(String),
    Ok,
    Warnings(Vec<String>),
    Errors(Vec<String>),
}

impl ReloadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ReloadEvent::Hash(_) => "hash",
            ReloadEvent::Ok => "ok",
            ReloadEvent::Warnings(_) => "warnings",
            ReloadEvent::Errors(_) => "errors",
        }
    }

    /// Encode as a server-sent event
    pub fn to_sse(&self) -> String {
        let data = match self {
            ReloadEvent::Hash(hash) => serde_json::Value::from(hash.as_str()),
            ReloadEvent::Ok => serde_json::Value::Null,
            ReloadEvent::Warnings(list) | ReloadEvent::Errors(list) => serde_json::Value::from(list.clone()),
        };
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }
}

/// Assets emitted by the last successful frontend compilation
pub struct AssetIndex {
    root: PathBuf,
    names: RwLock<HashSet<String>>,
}

impl AssetIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            names: RwLock::new(HashSet::new()),
        }
    }

    pub fn update(&self, report: &CompileReport) {
        let names = report.assets.iter().map(|a| a.name.clone()).collect();
        *self.names.write() = names;
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    /// Map a request path to an emitted asset file. Only exact asset names match.
    pub fn lookup(&self, request_path: &str) -> Option<PathBuf> {
        let name = request_path.trim_start_matches('/');
        if name.is_empty() || !self.names.read().contains(name) {
            return None;
        }
        Some(self.root.join(name))
    }
}

/// State shared by the listener and the frontend build loop
#[derive(Clone)]
pub struct DevState {
    proxy: Arc<BackendProxy>,
    assets: Arc<AssetIndex>,
    reload_tx: broadcast::Sender<ReloadEvent>,
}

impl DevState {
    pub fn new(proxy: BackendProxy, assets_root: impl Into<PathBuf>) -> Self {
        let (reload_tx, _) = broadcast::channel(64);
        Self {
            proxy: Arc::new(proxy),
            assets: Arc::new(AssetIndex::new(assets_root)),
            reload_tx,
        }
    }

    pub fn assets(&self) -> &AssetIndex {
        &self.assets
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.reload_tx.subscribe()
    }

    fn broadcast(&self, event: ReloadEvent) {
        // No connected browsers is not an error
        let _ = self.reload_tx.send(event);
    }

    /// Log a frontend compilation, update the served assets and notify browsers.
    /// Frontend failures are never fatal.
    pub fn on_compile(&self, outcome: CompileOutcome, stats: &StatsOptions) {
        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Frontend bundler failed");
                self.broadcast(ReloadEvent::Errors(vec![e.to_string()]));
                return;
            }
        };

        let summary = report.render(stats);
        if !summary.is_empty() {
            info!("Frontend compiled\n{}", summary);
        }

        if let Some(ref hash) = report.hash {
            self.broadcast(ReloadEvent::Hash(hash.clone()));
        }

        if report.has_errors() {
            for diagnostic in &report.errors {
                error!("{}", diagnostic);
            }
            self.broadcast(ReloadEvent::Errors(
                report.errors.iter().map(|d| d.to_string()).collect(),
            ));
            return;
        }

        self.assets.update(&report);

        if report.has_warnings() {
            for diagnostic in &report.warnings {
                warn!("{}", diagnostic);
            }
            self.broadcast(ReloadEvent::Warnings(
                report.warnings.iter().map(|d| d.to_string()).collect(),
            ));
        } else {
            self.broadcast(ReloadEvent::Ok);
        }
    }
}

pub struct DevServer {
    bind_addr: SocketAddr,
    state: DevState,
    shutdown_rx: watch_channel::Receiver<bool>,
}

impl DevServer {
    pub fn new(bind_addr: SocketAddr, state: DevState, shutdown_rx: watch_channel::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    /// Derive the development frontend build, start watching it and spawn the
    /// build loop and the listener.
    pub fn start(
        config: &Config,
        shutdown_rx: watch_channel::Receiver<bool>,
    ) -> Result<JoinHandle<anyhow::Result<()>>, DevError> {
        let client_origin = config.server.client_origin();
        let build = config.frontend_development();

        write_client_script(Path::new(&config.server.state_dir))?;

        let state = DevState::new(
            BackendProxy::new(config.server.api_origin()),
            PathBuf::from(&build.output.path),
        );

        let compiler = Arc::new(CommandCompiler::new("frontend", &config.server.state_dir));
        let options = WatchOptions::for_build(&build, config.server.watch_debounce())
            .ignoring(config.generated_dirs());
        info!(origin = %client_origin, entry = ?build.entry, "Compiling frontend in watch mode");
        let outcomes = watch(compiler, build, options)?;

        tokio::spawn(frontend_loop(
            state.clone(),
            outcomes,
            config.stats.clone(),
            shutdown_rx.clone(),
        ));

        let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.client_port)
            .parse()
            .map_err(|e| DevError::Config(format!("invalid dev server bind address: {}", e)))?;

        let server = DevServer::new(bind_addr, state, shutdown_rx);
        Ok(tokio::spawn(server.run()))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_on(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, backend = %self.state.proxy.target(), "Dev server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Dev server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn write_client_script(state_dir: &Path) -> Result<(), DevError> {
    std::fs::create_dir_all(state_dir)?;
    std::fs::write(state_dir.join(CLIENT_FILENAME), LIVE_RELOAD_CLIENT)?;
    Ok(())
}

async fn frontend_loop(
    state: DevState,
    mut outcomes: mpsc::Receiver<CompileOutcome>,
    stats: StatsOptions,
    mut shutdown_rx: watch_channel::Receiver<bool>,
) {
    loop {
        tokio::select! {
            outcome = outcomes.recv() => {
                let Some(outcome) = outcome else {
                    debug!("Frontend watch ended");
                    return;
                };
                state.on_compile(outcome, &stats);
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, state: DevState) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: DevState,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.method() == Method::GET {
        let path = req.uri().path();
        if path == EVENTS_PATH {
            debug!("Live-reload client connected");
            return Ok(event_stream(state.subscribe(), KEEP_ALIVE_INTERVAL));
        }
        if path == CLIENT_PATH {
            return Ok(client_script());
        }
        if let Some(file) = state.assets.lookup(path) {
            return Ok(serve_asset(&file).await);
        }
    }

    Ok(state.proxy.forward(req).await)
}

fn event_stream(
    mut events: broadcast::Receiver<ReloadEvent>,
    keep_alive: Duration,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(16);

    tokio::spawn(async move {
        if tx.send(Bytes::from_static(b": connected\n\n")).await.is_err() {
            return;
        }
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keep_alive, keep_alive);
        loop {
            let chunk = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => Bytes::from(event.to_sse()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Live-reload client lagged behind");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => Bytes::from_static(b": keep-alive\n\n"),
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
        .map(|chunk| Ok::<_, hyper::Error>(Frame::data(chunk)));

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/event-stream")
        .header(hyper::header::CACHE_CONTROL, "no-cache")
        .body(BodyExt::boxed(StreamBody::new(stream)))
        .expect("valid response builder")
}

fn client_script() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/javascript")
        .header(hyper::header::CACHE_CONTROL, "no-cache")
        .body(Full::new(Bytes::from_static(LIVE_RELOAD_CLIENT.as_bytes())).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

async fn serve_asset(file: &Path) -> Response<BoxBody<Bytes, hyper::Error>> {
    match tokio::fs::read(file).await {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, content_type(file))
            .body(Full::new(Bytes::from(content)).map_err(|never| match never {}).boxed())
            .expect("valid response builder"),
        Err(e) => {
            warn!(path = %file.display(), error = %e, "Failed to read compiled asset");
            json_error_response(ProxyErrorCode::AssetUnavailable, e.to_string())
        }
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("js") | Some("mjs") => "application/javascript",
        Some("css") => "text/css",
        Some("html") => "text/html; charset=utf-8",
        Some("json") | Some("map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{AssetStats, CompileError, Diagnostic};

    fn report(hash: &str, assets: &[&str]) -> CompileReport {
        CompileReport {
            hash: Some(hash.to_string()),
            assets: assets
                .iter()
                .map(|name| AssetStats {
                    name: name.to_string(),
                    size: 10,
                })
                .collect(),
            ..CompileReport::default()
        }
    }

    fn state() -> DevState {
        DevState::new(BackendProxy::new("http://localhost:3001"), "dist/public")
    }

    #[test]
    fn test_sse_encoding() {
        assert_eq!(
            ReloadEvent::Hash("abc".to_string()).to_sse(),
            "event: hash\ndata: \"abc\"\n\n"
        );
        assert_eq!(ReloadEvent::Ok.to_sse(), "event: ok\ndata: null\n\n");
        assert_eq!(
            ReloadEvent::Errors(vec!["bad".to_string()]).to_sse(),
            "event: errors\ndata: [\"bad\"]\n\n"
        );
    }

    #[test]
    fn test_asset_lookup_exact_names_only() {
        let index = AssetIndex::new("dist/public");
        assert!(index.is_empty());
        index.update(&report("h1", &["bundle.js", "css/app.css"]));

        assert_eq!(index.len(), 2);
        assert_eq!(index.lookup("/bundle.js"), Some(PathBuf::from("dist/public/bundle.js")));
        assert_eq!(index.lookup("/css/app.css"), Some(PathBuf::from("dist/public/css/app.css")));
        assert!(index.lookup("/").is_none());
        assert!(index.lookup("/api/users").is_none());
        assert!(index.lookup("/../secret").is_none());
    }

    async fn next_chunk(body: &mut BoxBody<Bytes, hyper::Error>) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("stream produced a frame")
            .unwrap()
            .unwrap();
        String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_event_stream_sends_events_and_keep_alives() {
        let state = state();
        let response = event_stream(state.subscribe(), Duration::from_millis(300));
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let mut body = response.into_body();

        assert_eq!(next_chunk(&mut body).await, ": connected\n\n");

        state.on_compile(Ok(report("h9", &["bundle.js"])), &StatsOptions::default());
        assert_eq!(next_chunk(&mut body).await, "event: hash\ndata: \"h9\"\n\n");
        assert_eq!(next_chunk(&mut body).await, "event: ok\ndata: null\n\n");

        // Nothing else happens, so the stream idles on keep-alive comments
        assert_eq!(next_chunk(&mut body).await, ": keep-alive\n\n");
    }

    #[tokio::test]
    async fn test_client_script_subscribes_to_event_stream() {
        let response = client_script();
        assert_eq!(response.headers()["content-type"], "application/javascript");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let script = String::from_utf8(body.to_vec()).unwrap();
        assert!(script.contains(EVENTS_PATH));
        assert!(script.contains("addEventListener('ok'"));
    }

    #[test]
    fn test_client_script_written_to_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join(".devrunner");
        write_client_script(&state_dir).unwrap();

        let written = std::fs::read_to_string(state_dir.join(CLIENT_FILENAME)).unwrap();
        assert_eq!(written, LIVE_RELOAD_CLIENT);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type(Path::new("bundle.js")), "application/javascript");
        assert_eq!(content_type(Path::new("bundle.js.map")), "application/json");
        assert_eq!(content_type(Path::new("logo.svg")), "image/svg+xml");
        assert_eq!(content_type(Path::new("LICENSE")), "application/octet-stream");
    }

    #[test]
    fn test_clean_compile_updates_assets_and_broadcasts() {
        let state = state();
        let mut rx = state.subscribe();

        state.on_compile(Ok(report("h1", &["bundle.js"])), &StatsOptions::default());

        assert!(state.assets().lookup("/bundle.js").is_some());
        assert_eq!(rx.try_recv().unwrap(), ReloadEvent::Hash("h1".to_string()));
        assert_eq!(rx.try_recv().unwrap(), ReloadEvent::Ok);
    }

    #[test]
    fn test_errors_keep_previous_assets() {
        let state = state();
        state.on_compile(Ok(report("h1", &["bundle.js"])), &StatsOptions::default());
        let mut rx = state.subscribe();

        let mut broken = report("h2", &["other.js"]);
        broken.errors = vec![Diagnostic::Text("Module not found".to_string())];
        state.on_compile(Ok(broken), &StatsOptions::default());

        assert!(state.assets().lookup("/bundle.js").is_some());
        assert!(state.assets().lookup("/other.js").is_none());
        assert_eq!(rx.try_recv().unwrap(), ReloadEvent::Hash("h2".to_string()));
        assert_eq!(
            rx.try_recv().unwrap(),
            ReloadEvent::Errors(vec!["Module not found".to_string()])
        );
    }

    #[test]
    fn test_warnings_broadcast() {
        let state = state();
        let mut rx = state.subscribe();

        let mut warned = report("h3", &["bundle.js"]);
        warned.warnings = vec![Diagnostic::Text("big bundle".to_string())];
        state.on_compile(Ok(warned), &StatsOptions::default());

        assert!(state.assets().lookup("/bundle.js").is_some());
        assert_eq!(rx.try_recv().unwrap(), ReloadEvent::Hash("h3".to_string()));
        assert_eq!(
            rx.try_recv().unwrap(),
            ReloadEvent::Warnings(vec!["big bundle".to_string()])
        );
    }

    #[test]
    fn test_bundler_failure_is_not_fatal() {
        let state = state();
        let mut rx = state.subscribe();

        state.on_compile(
            Err(CompileError::Failed {
                status: "exit status: 1".to_string(),
            }),
            &StatsOptions::default(),
        );

        match rx.try_recv().unwrap() {
            ReloadEvent::Errors(list) => assert!(list[0].contains("exit status: 1")),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
