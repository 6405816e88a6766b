//! Scripted in-memory session for integration tests.
//!
//! [`ScriptedSession`] plays back a fixed list of responses as soon as the
//! page navigates, so orchestrator-level tests run without a browser engine.
//! One struct implements the whole trait stack; `launch`/`new_context`/
//! `new_page` hand back clones sharing the same inner state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    BrowserContext, BrowserPage, BrowserResponse, BrowserSession, LoadState, PageFrame,
    ResourceType, SessionLauncher, SessionOptions, UrlPredicate,
};

/// One canned response, with builder-style setters.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub url: String,
    pub method: String,
    pub status: u16,
    pub resource_type: ResourceType,
    pub request_headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Simulate an opaque/evicted response: `body()` fails.
    pub fail_body: bool,
}

impl ScriptedResponse {
    /// A 200 XHR response carrying the given JSON value.
    pub fn json(url: impl Into<String>, value: serde_json::Value) -> Self {
        let body = serde_json::to_vec(&value).expect("scripted body serializes");
        let mut response_headers = HashMap::new();
        response_headers.insert(
            "content-type".to_string(),
            "application/json; charset=utf-8".to_string(),
        );
        Self {
            url: url.into(),
            method: "GET".to_string(),
            status: 200,
            resource_type: ResourceType::Xhr,
            request_headers: HashMap::new(),
            response_headers,
            body,
            fail_body: false,
        }
    }

    /// A response with raw (possibly non-JSON) bytes.
    pub fn raw(url: impl Into<String>, content_type: &str, body: Vec<u8>) -> Self {
        let mut response_headers = HashMap::new();
        response_headers.insert("content-type".to_string(), content_type.to_string());
        Self {
            url: url.into(),
            method: "GET".to_string(),
            status: 200,
            resource_type: ResourceType::Xhr,
            request_headers: HashMap::new(),
            response_headers,
            body,
            fail_body: false,
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_resource_type(mut self, rt: ResourceType) -> Self {
        self.resource_type = rt;
        self
    }

    pub fn with_request_header(mut self, name: &str, value: &str) -> Self {
        self.request_headers
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_response_header(mut self, name: &str, value: &str) -> Self {
        self.response_headers
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_failing_body(mut self) -> Self {
        self.fail_body = true;
        self
    }
}

#[async_trait]
impl BrowserResponse for ScriptedResponse {
    fn url(&self) -> &str {
        &self.url
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn status(&self) -> u16 {
        self.status
    }

    fn resource_type(&self) -> ResourceType {
        self.resource_type.clone()
    }

    async fn request_headers(&self) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.request_headers.clone())
    }

    async fn response_headers(&self) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.response_headers.clone())
    }

    async fn body(&self) -> anyhow::Result<Vec<u8>> {
        if self.fail_body {
            anyhow::bail!("response body is unavailable: target closed");
        }
        Ok(self.body.clone())
    }
}

struct Inner {
    responses: Mutex<Vec<Arc<ScriptedResponse>>>,
    sink: Mutex<Option<mpsc::UnboundedSender<Arc<dyn BrowserResponse>>>>,
    current_url: Mutex<String>,
    closed: AtomicBool,
    saved_states: Mutex<Vec<std::path::PathBuf>>,
}

/// Scripted playback of responses on navigation.
#[derive(Clone)]
pub struct ScriptedSession {
    inner: Arc<Inner>,
}

impl ScriptedSession {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            inner: Arc::new(Inner {
                responses: Mutex::new(responses.into_iter().map(Arc::new).collect()),
                sink: Mutex::new(None),
                current_url: Mutex::new(String::new()),
                closed: AtomicBool::new(false),
                saved_states: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn was_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn saved_storage_states(&self) -> Vec<std::path::PathBuf> {
        self.inner.saved_states.lock().unwrap().clone()
    }

    fn deliver_all(&self) {
        let sink = self.inner.sink.lock().unwrap().clone();
        let Some(sink) = sink else { return };
        for r in self.inner.responses.lock().unwrap().iter() {
            let response: Arc<dyn BrowserResponse> = r.clone();
            let _ = sink.send(response);
        }
    }
}

#[async_trait]
impl SessionLauncher for ScriptedSession {
    async fn launch(&self, _opts: &SessionOptions) -> anyhow::Result<Arc<dyn BrowserSession>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn new_context(&self, _opts: &SessionOptions) -> anyhow::Result<Arc<dyn BrowserContext>> {
        Ok(Arc::new(self.clone()))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl BrowserContext for ScriptedSession {
    async fn new_page(&self) -> anyhow::Result<Arc<dyn BrowserPage>> {
        Ok(Arc::new(self.clone()))
    }

    async fn storage_state(&self, path: &Path) -> anyhow::Result<()> {
        tokio::fs::write(path, b"{}").await?;
        self.inner
            .saved_states
            .lock()
            .unwrap()
            .push(path.to_path_buf());
        Ok(())
    }
}

#[async_trait]
impl BrowserPage for ScriptedSession {
    async fn goto(
        &self,
        url: &str,
        _wait_until: LoadState,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        *self.inner.current_url.lock().unwrap() = url.to_string();
        self.deliver_all();
        Ok(())
    }

    async fn wait_for_load_state(
        &self,
        _state: LoadState,
        _timeout: Duration,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn wait_for_url(&self, predicate: UrlPredicate, _timeout: Duration) -> anyhow::Result<()> {
        let current = self.inner.current_url.lock().unwrap().clone();
        if predicate(&current) {
            Ok(())
        } else {
            anyhow::bail!("scripted page never reached the expected URL")
        }
    }

    fn on_response(&self, sink: mpsc::UnboundedSender<Arc<dyn BrowserResponse>>) {
        *self.inner.sink.lock().unwrap() = Some(sink);
    }

    async fn frames(&self) -> Vec<Arc<dyn PageFrame>> {
        Vec::new()
    }
}
