//! Tracing installation and the event-name conventions of a capture run.
//!
//! Events across the workspace use dotted, component-prefixed names so a
//! single `RUST_LOG` target filter can slice one concern out of a run:
//!
//! - `run.*` — orchestrator lifecycle (`run.stage`, `run.capture.progress`,
//!   `run.deadline.expired`, `run.fatal`)
//! - `capture.*` — per-response worker outcomes (`capture.response.persisted`,
//!   `capture.response.duplicate`, `capture.journal.append_failed`)
//! - `store.*` / `journal.*` — persistence paths
//!
//! [`init_logging`] installs the process-wide subscriber exactly once: a
//! daily-rolling file sink, an optional stderr mirror, text or JSON
//! encoding, and `RUST_LOG` filtering. Later calls are no-ops that hand back
//! the sink path the first call chose.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Prefix of the daily-rolled log files (`apiscope.log.YYYY-MM-DD`).
pub const LOG_FILE_NAME: &str = "apiscope.log";

const LOG_DIR_ENV: &str = "APISCOPE_LOG_DIR";

/// The installed sink. The worker guard must outlive the process or
/// buffered events are lost on exit.
struct Sink {
    path: PathBuf,
    _guard: WorkerGuard,
}

static ACTIVE: OnceLock<Sink> = OnceLock::new();

/// Knobs for [`init_logging`]. The zero value is the sensible default:
/// text encoding, file sink only, `info` filter.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Where the rolling log file lives. When unset, `$APISCOPE_LOG_DIR` is
    /// consulted, then `~/.local/share/apiscope`.
    pub dir: Option<PathBuf>,
    /// Encode events as JSON objects instead of formatted text.
    pub json: bool,
    /// Mirror events to stderr in addition to the file sink.
    pub mirror_stderr: bool,
    /// Filter applied when `RUST_LOG` is unset; defaults to `info`.
    pub default_filter: Option<&'static str>,
}

/// Install the global `tracing` subscriber and return the sink path prefix.
///
/// Idempotent: only the first call installs anything.
pub fn init_logging(options: LogOptions) -> anyhow::Result<PathBuf> {
    if let Some(active) = ACTIVE.get() {
        return Ok(active.path.clone());
    }

    let dir = sink_directory(options.dir);
    std::fs::create_dir_all(&dir)
        .map_err(|e| anyhow::anyhow!("cannot create log directory {}: {e}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(rolling::daily(&dir, LOG_FILE_NAME));

    // The sink combinations only differ in which boxed layers get stacked.
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(if options.json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_ansi(false).with_writer(writer).boxed()
    });
    if options.mirror_stderr {
        layers.push(if options.json {
            fmt::layer().json().with_writer(std::io::stderr).boxed()
        } else {
            fmt::layer().with_writer(std::io::stderr).boxed()
        });
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_filter.unwrap_or("info")));

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing setup failed: {e}"))?;

    let path = dir.join(LOG_FILE_NAME);
    let _ = ACTIVE.set(Sink {
        path: path.clone(),
        _guard: guard,
    });
    Ok(path)
}

fn sink_directory(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(LOG_DIR_ENV).map(PathBuf::from))
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local")
                .join("share")
                .join("apiscope")
        })
}
