//! Pomodoro command - focus/break cycles

use std::time::Duration;

use anyhow::bail;
use colored::Colorize;

use super::{print_view, progress_bar, runtime, update_bar, AppContext, GlobalOptions};
use crate::cycle::{CycleController, CycleEvent, RemoteChange};
use crate::duration_fmt::parse_duration;
use crate::session_sync::{sessions_to_follow, SessionSync};
use crate::types::{CycleConfig, EntityRecord, KindGroup, SessionStatus};

/// Per-run overrides of the configured cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOverrides {
    pub focus: Option<String>,
    pub short_break: Option<String>,
    pub long_break: Option<String>,
    pub cycles: Option<u32>,
    pub long_break_every: Option<u32>,
}

impl CycleOverrides {
    pub fn apply(&self, mut config: CycleConfig) -> anyhow::Result<CycleConfig> {
        let millis = |text: &str| -> anyhow::Result<u64> {
            let duration = parse_duration(text).map_err(anyhow::Error::msg)?;
            Ok(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        };
        if let Some(focus) = &self.focus {
            config.focus_ms = millis(focus)?;
        }
        if let Some(short_break) = &self.short_break {
            config.short_break_ms = millis(short_break)?;
        }
        if let Some(long_break) = &self.long_break {
            config.long_break_ms = millis(long_break)?;
        }
        if let Some(cycles) = self.cycles {
            config.cycle_count = cycles;
        }
        if let Some(every) = self.long_break_every {
            config.long_break_every = every;
        }
        if let Err(errors) = config.validate() {
            bail!("Invalid pomodoro settings: {}", errors.join(", "));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PomodoroAction {
    Run {
        overrides: CycleOverrides,
        activity: Option<String>,
    },
    Status,
    Skip,
    Pause,
    Resume,
    Stop,
}

pub fn run(options: &GlobalOptions, action: PomodoroAction) -> anyhow::Result<()> {
    let ctx = AppContext::load(options)?;
    let rt = runtime()?;
    rt.block_on(async {
        let sessions = ctx.sessions()?;
        let mut controller = CycleController::new(ctx.timer(), ctx.config.pomodoro.to_cycle_config())
            .with_diagnostics(ctx.diagnostics.clone());
        restore_latest(&sessions, &mut controller).await?;

        let result = apply(&sessions, &mut controller, action).await;
        sessions
            .persist_all(controller.drain_archived(), controller.session())
            .await?;
        ctx.finish().await;
        result
    })
}

async fn restore_latest(
    sessions: &SessionSync,
    controller: &mut CycleController,
) -> anyhow::Result<()> {
    let Some(persisted) = sessions.load_latest(KindGroup::Pomodoro).await? else {
        return Ok(());
    };
    if matches!(
        persisted.status,
        SessionStatus::Cancelled | SessionStatus::Completed | SessionStatus::Idle
    ) {
        return Ok(());
    }
    let events = controller.restore(persisted)?;
    if !events.is_empty() {
        println!("{}", "While cadence was not running:".dimmed());
        for event in &events {
            println!("  {}", describe(event));
        }
    }
    Ok(())
}

pub(crate) fn describe(event: &CycleEvent) -> String {
    match event {
        CycleEvent::FocusStarted { cycle } => format!("{} focus #{cycle} started", "▶".green()),
        CycleEvent::FocusCompleted { completed } => {
            format!("{} focus completed ({completed} total)", "✓".green())
        }
        CycleEvent::BreakStarted { long: true } => format!("{} long break started", "☕".cyan()),
        CycleEvent::BreakStarted { long: false } => format!("{} short break started", "☕".cyan()),
        CycleEvent::Skipped { kind } => format!("{} {kind} skipped", "»".yellow()),
        CycleEvent::CycleCompleted => format!("{}", "✓ Pomodoro cycle completed".green().bold()),
    }
}

async fn apply(
    sessions: &SessionSync,
    controller: &mut CycleController,
    action: PomodoroAction,
) -> anyhow::Result<()> {
    match action {
        PomodoroAction::Run {
            overrides,
            activity,
        } => {
            if controller.status().is_active() {
                bail!("A pomodoro cycle is already running. Use `cadence pomodoro status` to see it.");
            }
            let config = overrides.apply(controller.config().clone())?;
            controller
                .update_config(config)
                .map_err(|errors| anyhow::anyhow!(errors.join(", ")))?;
            for event in controller.start(activity)? {
                println!("{}", describe(&event));
            }
            sessions
                .persist_all(controller.drain_archived(), controller.session())
                .await?;
            live(sessions, controller).await?;
        }
        PomodoroAction::Status => {
            println!("{}", "\nPomodoro\n".bold());
            print_view(&controller.view());
            if controller.session().is_some() {
                println!(
                    "  cycle:     {} of {}",
                    controller.cycle_index().to_string().cyan(),
                    controller.config().cycle_count
                );
            }
            println!(
                "  completed: {}",
                controller.completed_focus().to_string().cyan()
            );
            println!();
        }
        PomodoroAction::Skip => {
            for event in controller.skip_to_next()? {
                println!("{}", describe(&event));
            }
        }
        PomodoroAction::Pause => {
            for event in controller.pause()? {
                println!("{}", describe(&event));
            }
            println!("{} Paused", "⏸".yellow());
        }
        PomodoroAction::Resume => {
            controller.resume()?;
            println!("{} Resumed", "▶".green());
        }
        PomodoroAction::Stop => {
            controller.cancel()?;
            println!("{} Pomodoro cycle stopped", "✗".red());
        }
    }
    Ok(())
}

/// Offer the stored sessions to the controller after the collection changed.
fn follow_remote(controller: &mut CycleController, records: &[EntityRecord]) -> Vec<RemoteChange> {
    let current = controller.session().map(|s| s.id.clone());
    sessions_to_follow(records, current.as_deref(), KindGroup::Pomodoro)
        .into_iter()
        .filter_map(|session| controller.apply_remote(session))
        .collect()
}

/// Drive the cycle in the foreground until it completes, is stopped
/// elsewhere, or Ctrl-C.
async fn live(sessions: &SessionSync, controller: &mut CycleController) -> anyhow::Result<()> {
    let bar = progress_bar(controller.view().total)?;
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut remote = sessions.handle().subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            // Remote changes go first so a stop made elsewhere is not
            // overtaken by a local phase change.
            biased;

            changed = remote.changed() => {
                if changed.is_err() {
                    bar.abandon_with_message("sync stopped".to_string());
                    return Ok(());
                }
                let records = remote.borrow_and_update().records.clone();
                for change in follow_remote(controller, &records) {
                    match change {
                        RemoteChange::Adopted(SessionStatus::Cancelled) => {
                            update_bar(&bar, &controller.view());
                            bar.abandon_with_message("stopped elsewhere".to_string());
                            return Ok(());
                        }
                        RemoteChange::Adopted(SessionStatus::Paused) => {
                            bar.println(format!("{} Paused elsewhere", "⏸".yellow()));
                        }
                        RemoteChange::Adopted(SessionStatus::Running) => {
                            bar.println(format!("{} Resumed elsewhere", "▶".green()));
                        }
                        RemoteChange::Adopted(_) => {}
                        RemoteChange::Followed(events) => {
                            for event in &events {
                                bar.println(describe(event));
                            }
                            sessions
                                .persist_all(controller.drain_archived(), controller.session())
                                .await?;
                        }
                    }
                }
                update_bar(&bar, &controller.view());
                if controller.is_finished() {
                    bar.finish_with_message("done".to_string());
                    return Ok(());
                }
            }
            _ = interval.tick() => {
                let events = controller.tick();
                if !events.is_empty() {
                    for event in &events {
                        bar.println(describe(event));
                    }
                    sessions
                        .persist_all(controller.drain_archived(), controller.session())
                        .await?;
                    sessions.handle().flush().await?;
                }
                update_bar(&bar, &controller.view());
                if controller.is_finished() {
                    bar.finish_with_message("done".to_string());
                    return Ok(());
                }
            }
            _ = &mut ctrl_c => {
                bar.abandon_with_message("still running in the background".to_string());
                return Ok(());
            }
        }
    }
}
