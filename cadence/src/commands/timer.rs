//! Timer command - leisure/study countdown with drift-corrected restore

use std::time::Duration;

use anyhow::bail;
use colored::Colorize;

use super::{print_view, progress_bar, runtime, update_bar, AppContext, GlobalOptions};
use crate::duration_fmt::{format_human, parse_duration};
use crate::session_sync::{record_to_session, SessionSync};
use crate::timer::{RestoreOutcome, SessionSpec, SessionTimer};
use crate::types::{EntityRecord, SessionKind, SessionStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    Start {
        duration: Option<String>,
        activity: Option<String>,
    },
    Pause,
    Resume,
    Cancel,
    Restart,
    Status,
    Watch,
}

pub fn run(options: &GlobalOptions, kind: SessionKind, action: TimerAction) -> anyhow::Result<()> {
    if !matches!(kind, SessionKind::Leisure | SessionKind::Study) {
        bail!("Timer kind must be leisure or study (use `cadence pomodoro` for focus sessions)");
    }
    let ctx = AppContext::load(options)?;
    let rt = runtime()?;
    rt.block_on(async {
        let sessions = ctx.sessions()?;
        let mut timer = ctx.timer();
        restore_latest(&sessions, &mut timer, kind).await?;

        let result = apply(&ctx, &sessions, &mut timer, kind, action).await;
        sessions
            .persist_all(timer.drain_archived(), timer.session())
            .await?;
        ctx.finish().await;
        result
    })
}

async fn restore_latest(
    sessions: &SessionSync,
    timer: &mut SessionTimer,
    kind: SessionKind,
) -> anyhow::Result<()> {
    let Some(persisted) = sessions.load_latest(kind.group()).await? else {
        return Ok(());
    };
    if let RestoreOutcome::Expired(expiry) = timer.restore(persisted)? {
        println!(
            "{}",
            format!(
                "Your {} session finished at {} while cadence was not running.",
                expiry.kind,
                expiry.at.with_timezone(&chrono::Local).format("%H:%M:%S")
            )
            .yellow()
        );
    }
    Ok(())
}

async fn apply(
    ctx: &AppContext,
    sessions: &SessionSync,
    timer: &mut SessionTimer,
    kind: SessionKind,
    action: TimerAction,
) -> anyhow::Result<()> {
    match action {
        TimerAction::Start { duration, activity } => {
            let duration = match duration {
                Some(text) => parse_duration(&text).map_err(anyhow::Error::msg)?,
                None => Duration::from_secs(ctx.config.leisure.default_minutes * 60),
            };
            let session = timer.start(SessionSpec::new(kind, duration).with_activity(activity))?;
            println!(
                "{} {} timer started for {}",
                "✓".green(),
                session.kind,
                format_human(duration).cyan()
            );
        }
        TimerAction::Pause => {
            let session = timer.pause()?;
            if session.status == SessionStatus::Expired {
                println!("{}", "Timer had already finished.".yellow());
            } else {
                println!("{} Paused", "⏸".yellow());
            }
        }
        TimerAction::Resume => {
            timer.resume()?;
            println!("{} Resumed", "▶".green());
        }
        TimerAction::Cancel => {
            timer.cancel()?;
            println!("{} Cancelled", "✗".red());
        }
        TimerAction::Restart => {
            timer.restart()?;
            println!("{} Restarted", "↻".green());
        }
        TimerAction::Status => {
            println!("{}", format!("\n{} timer\n", kind).bold());
            print_view(&timer.view());
            println!(
                "  sync:      {}",
                sessions.handle().view().status.to_string().dimmed()
            );
            println!();
        }
        TimerAction::Watch => watch(sessions, timer).await?,
    }
    Ok(())
}

/// Take over the stored copy of the current session when another process
/// changed it. Returns the resulting status.
fn follow_remote(timer: &mut SessionTimer, records: &[EntityRecord]) -> Option<SessionStatus> {
    let id = timer.session()?.id.clone();
    let remote = records
        .iter()
        .find(|r| r.id == id)
        .and_then(record_to_session)?;
    timer.apply_remote(remote).then(|| timer.status())
}

/// Live progress until the session ends, is cancelled elsewhere, or Ctrl-C.
async fn watch(sessions: &SessionSync, timer: &mut SessionTimer) -> anyhow::Result<()> {
    if !timer.status().is_active() {
        print_view(&timer.view());
        return Ok(());
    }

    // Re-arm the heartbeat checkpoint for the lifetime of this process.
    if let Some(session) = timer.session() {
        sessions.persist(session).await?;
    }

    let bar = progress_bar(timer.view().total)?;
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut remote = sessions.handle().subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            biased;

            changed = remote.changed() => {
                if changed.is_err() {
                    bar.abandon_with_message("sync stopped".to_string());
                    return Ok(());
                }
                let records = remote.borrow_and_update().records.clone();
                match follow_remote(timer, &records) {
                    Some(SessionStatus::Cancelled) => {
                        update_bar(&bar, &timer.view());
                        bar.abandon_with_message("cancelled elsewhere".to_string());
                        return Ok(());
                    }
                    Some(SessionStatus::Expired | SessionStatus::Completed) => {
                        update_bar(&bar, &timer.view());
                        bar.finish_with_message("finished elsewhere".to_string());
                        return Ok(());
                    }
                    Some(SessionStatus::Paused) => {
                        bar.println(format!("{} Paused elsewhere", "⏸".yellow()));
                    }
                    Some(SessionStatus::Running) => {
                        bar.println(format!("{} Resumed elsewhere", "▶".green()));
                    }
                    Some(SessionStatus::Idle) | None => {}
                }
                update_bar(&bar, &timer.view());
            }
            _ = interval.tick() => {
                if let Some(expiry) = timer.tick() {
                    update_bar(&bar, &timer.view());
                    bar.finish_with_message(format!("{} finished", expiry.kind));
                    if let Some(session) = timer.session() {
                        sessions.persist(session).await?;
                    }
                    return Ok(());
                }
                update_bar(&bar, &timer.view());
            }
            _ = &mut ctrl_c => {
                bar.abandon_with_message("still running in the background".to_string());
                return Ok(());
            }
        }
    }
}
