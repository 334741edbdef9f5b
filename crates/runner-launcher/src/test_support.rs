// Test doubles shared by the unit tests of this crate: a canned HTTP server,
// an in-memory ActionsApi and fabricated runner installations.

use crate::github_api::{ActionsApi, ApiResponse, IssuedToken, RateLimit, RegisteredRunner, RunnerScope};
use anyhow::Result;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use launcher_common::{LauncherContext, LauncherSettings, SecretMasker, TraceManager};
use launcher_sdk::trace::CollectingTraceWriter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// A launcher context whose traces are collected for assertions.
pub fn test_context(settings: LauncherSettings) -> (Arc<LauncherContext>, Arc<CollectingTraceWriter>) {
    let sink = Arc::new(CollectingTraceWriter::new());
    let manager = TraceManager::with_sink(SecretMasker::new(), sink.clone());
    (LauncherContext::with_trace_manager(settings, manager), sink)
}

/// A reqwest client that ignores proxy environment variables.
pub fn local_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

// ---------------------------------------------------------------------------
// HTTP fake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Self::bytes(status, body.as_bytes().to_vec()).with_header("content-type", "application/json")
    }

    pub fn bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self::bytes(status, Vec::new())
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub authorization: Option<String>,
}

/// Serves canned replies keyed by `"METHOD /path?query"`; anything else is a 404.
pub struct HttpFake {
    url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

type Routes = Arc<HashMap<String, Reply>>;
type Recorded = Arc<Mutex<Vec<RecordedRequest>>>;

impl HttpFake {
    pub async fn start(routes: Vec<(&str, Reply)>) -> Self {
        let routes: Routes = Arc::new(
            routes
                .into_iter()
                .map(|(key, reply)| (key.to_string(), reply))
                .collect(),
        );
        let requests: Recorded = Arc::new(Mutex::new(Vec::new()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let std_listener = listener.into_std().unwrap();
        std_listener.set_nonblocking(true).unwrap();

        let recorded = requests.clone();
        let make_service = make_service_fn(move |_| {
            let routes = routes.clone();
            let recorded = recorded.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    serve_request(routes.clone(), recorded.clone(), req)
                }))
            }
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = Server::from_tcp(std_listener)
            .unwrap()
            .serve(make_service)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("fake HTTP server stopped: {err}");
            }
        });

        Self {
            url: format!("http://{addr}"),
            requests,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for HttpFake {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

async fn serve_request(
    routes: Routes,
    recorded: Recorded,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let authorization = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let key = format!("{} {target}", req.method());
    recorded.lock().push(RecordedRequest {
        method: req.method().to_string(),
        target,
        authorization,
    });

    let reply = routes
        .get(&key)
        .cloned()
        .unwrap_or_else(|| Reply::bytes(404, b"not found".to_vec()));
    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = StatusCode::from_u16(reply.status).unwrap();
    for (name, value) in &reply.headers {
        response.headers_mut().insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// ActionsApi fake
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeApiState {
    token: Option<String>,
    registration_error: Option<String>,
    registration_stalls: bool,
    remove_token_error: Option<String>,
    list_error: Option<String>,
    rate: Option<RateLimit>,
    registered: Vec<RegisteredRunner>,
    calls: Vec<String>,
}

/// In-memory `ActionsApi` recording every call as `"<operation> <scope>"`.
pub struct FakeApi {
    state: Mutex<FakeApiState>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeApiState {
                token: Some("REGTOKEN".to_string()),
                ..Default::default()
            }),
        }
    }

    pub fn with_rate(self, limit: u64, remaining: u64) -> Self {
        self.state.lock().rate = Some(RateLimit {
            limit,
            remaining,
            reset: None,
        });
        self
    }

    pub fn with_registered(self, id: u64, name: &str) -> Self {
        self.state.lock().registered.push(RegisteredRunner {
            id,
            name: name.to_string(),
            status: "offline".to_string(),
        });
        self
    }

    pub fn with_empty_token(self) -> Self {
        self.state.lock().token = Some(String::new());
        self
    }

    pub fn failing_registration(self, message: &str) -> Self {
        self.state.lock().registration_error = Some(message.to_string());
        self
    }

    /// Registration token requests never complete.
    pub fn stalling_registration(self) -> Self {
        self.state.lock().registration_stalls = true;
        self
    }

    pub fn failing_remove_token(self, message: &str) -> Self {
        self.state.lock().remove_token_error = Some(message.to_string());
        self
    }

    pub fn failing_list(self, message: &str) -> Self {
        self.state.lock().list_error = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .count()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl ActionsApi for FakeApi {
    async fn create_registration_token(
        &self,
        _access_token: &str,
        scope: &RunnerScope,
    ) -> Result<ApiResponse<IssuedToken>> {
        self.record(format!("registration-token {scope}"));
        let stalls = self.state.lock().registration_stalls;
        if stalls {
            futures::future::pending::<()>().await;
        }
        let state = self.state.lock();
        if let Some(message) = &state.registration_error {
            anyhow::bail!("{message}");
        }
        Ok(ApiResponse {
            body: IssuedToken {
                token: state.token.clone().unwrap_or_default(),
                expires_at: None,
            },
            rate: state.rate,
        })
    }

    async fn create_remove_token(
        &self,
        _access_token: &str,
        scope: &RunnerScope,
    ) -> Result<ApiResponse<IssuedToken>> {
        self.record(format!("remove-token {scope}"));
        let state = self.state.lock();
        if let Some(message) = &state.remove_token_error {
            anyhow::bail!("{message}");
        }
        Ok(ApiResponse {
            body: IssuedToken {
                token: "REMOVETOKEN".to_string(),
                expires_at: None,
            },
            rate: state.rate,
        })
    }

    async fn list_runners(
        &self,
        _access_token: &str,
        scope: &RunnerScope,
    ) -> Result<ApiResponse<Vec<RegisteredRunner>>> {
        self.record(format!("list {scope}"));
        let state = self.state.lock();
        if let Some(message) = &state.list_error {
            anyhow::bail!("{message}");
        }
        Ok(ApiResponse {
            body: state.registered.clone(),
            rate: state.rate,
        })
    }

    async fn delete_runner(&self, _access_token: &str, _scope: &RunnerScope, runner_id: u64) -> Result<()> {
        self.record(format!("delete {runner_id}"));
        self.state.lock().registered.retain(|r| r.id != runner_id);
        Ok(())
    }

    async fn authenticated_user(&self, _access_token: &str) -> Result<String> {
        self.record("user".to_string());
        Ok("octocat".to_string())
    }
}

// ---------------------------------------------------------------------------
// Runner installations
// ---------------------------------------------------------------------------

/// Scripts standing in for the programs shipped in a runner archive.
#[derive(Debug, Clone)]
pub struct RunnerScripts {
    pub config: String,
    pub run: String,
    pub install_dependencies: String,
}

impl Default for RunnerScripts {
    fn default() -> Self {
        Self {
            // Appends its arguments, one invocation per line.
            config: "#!/bin/sh\necho \"configuring $*\"\necho \"$*\" >> \"$(dirname \"$0\")/config.log\"\n"
                .to_string(),
            // Runs until interrupted.
            run: "#!/bin/sh\ntouch \"$(dirname \"$0\")/run.started\"\necho \"listening for jobs\"\ntrap 'echo \"stopping\"; exit 0' INT TERM\nwhile true; do sleep 0.1; done\n"
                .to_string(),
            install_dependencies: "#!/bin/sh\ntouch \"$(dirname \"$0\")/../deps.installed\"\n"
                .to_string(),
        }
    }
}

impl RunnerScripts {
    fn files(&self) -> [(&'static str, &str); 3] {
        [
            ("config.sh", self.config.as_str()),
            ("run.sh", self.run.as_str()),
            ("bin/installdependencies.sh", self.install_dependencies.as_str()),
        ]
    }

    /// Write the scripts into `dir` as an already provisioned installation.
    pub fn install(&self, dir: &Path) {
        for (name, contents) in self.files() {
            write_executable(&dir.join(name), contents);
        }
    }

    /// A gzip-compressed tarball of the scripts.
    pub fn archive(&self) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in self.files() {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }
}

pub fn write_executable(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
