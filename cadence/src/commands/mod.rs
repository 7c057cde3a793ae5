//! CLI command handlers. Each invocation restores persisted state, applies
//! one action, flushes pending writes, and exits.

pub mod config;
pub mod pomodoro;
pub mod records;
pub mod timer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use colored::Colorize;

use crate::clock::{SharedClock, SystemClock};
use crate::collection_sync::SyncHub;
use crate::config::{read_config_with_env, resolve_data_dir, resolve_paths, ConfigLocation};
use crate::diagnostics::Diagnostics;
use crate::duration_fmt::{format_clock, format_human};
use crate::registry::SessionRegistry;
use crate::session_sync::SessionSync;
use crate::store::FileStore;
use crate::timer::SessionTimer;
use crate::types::{CadenceConfig, DiagnosticVerbosity, SessionStatus, SessionView};

/// Global flags shared by every command
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    /// `--debug [VERBOSITY]`: enable drift diagnostics echoed to stderr.
    pub debug: Option<Option<String>>,
}

/// Everything a command needs: resolved config, the file store, and the
/// in-process session registry.
pub struct AppContext {
    pub location: ConfigLocation,
    pub config: CadenceConfig,
    pub data_dir: PathBuf,
    pub clock: SharedClock,
    pub registry: SessionRegistry,
    pub diagnostics: Diagnostics,
    pub hub: SyncHub,
}

impl AppContext {
    pub fn load(options: &GlobalOptions) -> anyhow::Result<Self> {
        let location = resolve_paths();
        let mut config = read_config_with_env(&location.config_path)
            .with_context(|| format!("Failed to load config from {}", location.config_path))?;

        let echo = match &options.debug {
            Some(verbosity) => {
                config.diagnostics.enabled = true;
                if let Some(v) = verbosity {
                    config.diagnostics.verbosity = v
                        .parse::<DiagnosticVerbosity>()
                        .map_err(anyhow::Error::msg)?;
                }
                true
            }
            None => false,
        };

        let data_dir = resolve_data_dir(&location, &config.data_dir);
        let store = FileStore::open(data_dir.join("store"))
            .with_context(|| format!("Failed to open store in {}", data_dir.display()))?;
        let diagnostics = Diagnostics::from_config(&config.diagnostics, &data_dir, echo);
        let clock: SharedClock = Arc::new(SystemClock);
        let hub = SyncHub::new(Arc::new(store), config.sync.clone(), Arc::clone(&clock))
            .with_diagnostics(diagnostics.clone());

        Ok(Self {
            location,
            config,
            data_dir,
            clock,
            registry: SessionRegistry::new(),
            diagnostics,
            hub,
        })
    }

    pub fn owner(&self) -> &str {
        &self.config.owner
    }

    pub fn timer(&self) -> SessionTimer {
        SessionTimer::new(self.owner(), Arc::clone(&self.clock), self.registry.clone())
            .with_diagnostics(self.diagnostics.clone())
    }

    /// Must be called inside the runtime.
    pub fn sessions(&self) -> anyhow::Result<SessionSync> {
        Ok(SessionSync::new(self.hub.sessions(self.owner())?))
    }

    /// Flush every collection and stop its loop.
    pub async fn finish(&self) {
        self.hub.shutdown_all(true).await;
        if let Some(path) = self.diagnostics.log_file() {
            eprintln!("{}", format!("Diagnostics written to {}", path.display()).dimmed());
        }
    }
}

pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

pub(crate) fn status_label(status: SessionStatus) -> String {
    let text = status.to_string();
    match status {
        SessionStatus::Running => text.green().to_string(),
        SessionStatus::Paused => text.yellow().to_string(),
        SessionStatus::Expired | SessionStatus::Completed => text.cyan().to_string(),
        SessionStatus::Cancelled => text.red().to_string(),
        SessionStatus::Idle => text.dimmed().to_string(),
    }
}

pub(crate) fn print_view(view: &SessionView) {
    let Some(kind) = view.kind else {
        println!("  {}", "No session".dimmed());
        return;
    };
    println!(
        "  {} {} {}",
        "●".green(),
        kind.to_string().bold(),
        status_label(view.status)
    );
    println!(
        "  remaining: {}  of {}",
        format_clock(view.remaining).cyan(),
        format_human(view.total)
    );
    if let Some(activity) = &view.activity {
        println!("  activity:  {}", activity.cyan());
    }
}

pub(crate) fn progress_bar(total: std::time::Duration) -> anyhow::Result<indicatif::ProgressBar> {
    let bar = indicatif::ProgressBar::new(total.as_secs().max(1));
    bar.set_style(
        indicatif::ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {msg}")?
            .progress_chars("=> "),
    );
    Ok(bar)
}

/// Draw one frame of a live timer.
pub(crate) fn update_bar(bar: &indicatif::ProgressBar, view: &SessionView) {
    let total = view.total.as_secs().max(1);
    if bar.length() != Some(total) {
        bar.set_length(total);
    }
    bar.set_position(total.saturating_sub(view.remaining.as_secs()));
    if let Some(kind) = view.kind {
        bar.set_prefix(kind.to_string());
    }
    bar.set_message(format!(
        "{} {}",
        format_clock(view.remaining),
        status_label(view.status)
    ));
}
