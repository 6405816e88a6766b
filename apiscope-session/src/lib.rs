//! Interfaces to the browser automation subsystem.
//!
//! The capture pipeline never talks to a browser engine directly; it drives
//! these traits. A production host wires them to a real engine (CDP,
//! WebDriver, Playwright-style server), while tests use the
//! [`testing::ScriptedSession`] implementation shipped here.
//!
//! Response delivery is push-based: the page enqueues every
//! [`BrowserResponse`] into the sink registered via
//! [`BrowserPage::on_response`]. Implementations must only enqueue — never
//! read bodies or otherwise await inside the delivery path — so the engine's
//! event loop is not serialized on capture work.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use apiscope_common::ConsentAction;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod testing;

/// Load states a page can be awaited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    DomContentLoaded,
    NetworkIdle,
}

/// Engine-reported resource type of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceType {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    Xhr,
    Fetch,
    EventSource,
    Websocket,
    Manifest,
    Other(String),
}

impl ResourceType {
    /// Programmatic request kinds that default-mode capture keys on.
    pub fn is_xhr_or_fetch(&self) -> bool {
        matches!(self, Self::Xhr | Self::Fetch)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Document => "document",
            Self::Stylesheet => "stylesheet",
            Self::Image => "image",
            Self::Media => "media",
            Self::Font => "font",
            Self::Script => "script",
            Self::Xhr => "xhr",
            Self::Fetch => "fetch",
            Self::EventSource => "eventsource",
            Self::Websocket => "websocket",
            Self::Manifest => "manifest",
            Self::Other(s) => s.as_str(),
        }
    }
}

/// Options forwarded to the engine at launch/context creation.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub user_agent: Option<String>,
    /// Opaque cookies/local-storage blob to seed the context with.
    pub storage_state: Option<PathBuf>,
    /// Ask the engine to record a HAR archive at this path.
    pub record_har: Option<PathBuf>,
    /// Ask the engine to record an engine trace.
    pub trace: bool,
}

/// Entry point: launches a browser and hands back a session.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, opts: &SessionOptions) -> anyhow::Result<Arc<dyn BrowserSession>>;
}

/// A running browser instance.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_context(&self, opts: &SessionOptions) -> anyhow::Result<Arc<dyn BrowserContext>>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// An isolated cookie/storage container inside a session.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self) -> anyhow::Result<Arc<dyn BrowserPage>>;

    /// Persist cookies/local storage to `path` as an opaque blob.
    async fn storage_state(&self, path: &Path) -> anyhow::Result<()>;

    /// Optional engine tracing hooks. Engines without support return
    /// `Ok(false)` and the caller downgrades the toggle.
    async fn start_tracing(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn stop_tracing(&self, _path: &Path) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Predicate over the page's current URL, used for host-reach waits.
pub type UrlPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A tab. All waits are bounded by the caller-supplied timeout.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(
        &self,
        url: &str,
        wait_until: LoadState,
        timeout: Duration,
    ) -> anyhow::Result<()>;

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration)
        -> anyhow::Result<()>;

    async fn wait_for_url(&self, predicate: UrlPredicate, timeout: Duration)
        -> anyhow::Result<()>;

    /// Register the response sink. Implementations must only enqueue into it.
    fn on_response(&self, sink: mpsc::UnboundedSender<Arc<dyn BrowserResponse>>);

    /// All frames currently attached, main frame first.
    async fn frames(&self) -> Vec<Arc<dyn PageFrame>>;
}

/// One network response observed by the engine.
///
/// Header and body access are suspension points: engines fetch them lazily
/// and either may fail once the originating context has gone away.
#[async_trait]
pub trait BrowserResponse: Send + Sync {
    fn url(&self) -> &str;
    fn method(&self) -> &str;
    fn status(&self) -> u16;
    fn resource_type(&self) -> ResourceType;

    async fn request_headers(&self) -> anyhow::Result<HashMap<String, String>>;
    async fn response_headers(&self) -> anyhow::Result<HashMap<String, String>>;

    /// May fail for opaque responses or after the context closed.
    async fn body(&self) -> anyhow::Result<Vec<u8>>;
}

/// Minimal frame surface needed by interstitial handlers.
#[async_trait]
pub trait PageFrame: Send + Sync {
    fn url(&self) -> String;
    async fn query_selector(&self, selector: &str) -> anyhow::Result<bool>;
    async fn click(&self, selector: &str) -> anyhow::Result<()>;
}

/// Pluggable consent/interstitial dismissal.
#[async_trait]
pub trait InterstitialHandler: Send + Sync {
    /// Stable name used for selection via `consent_handlers`.
    fn name(&self) -> &'static str;

    async fn matches(&self, frame: &dyn PageFrame) -> bool;

    /// Returns `Ok(true)` when the interstitial was dismissed.
    async fn dismiss(
        &self,
        frame: &dyn PageFrame,
        action: ConsentAction,
        timeout: Duration,
    ) -> anyhow::Result<bool>;
}

/// User-authored interaction with the page, run once before the capture window.
#[async_trait]
pub trait FlowScript: Send + Sync {
    async fn run(&self, page: Arc<dyn BrowserPage>) -> anyhow::Result<()>;
}
