use clap::{Parser, Subcommand};

use cadence::commands;
use cadence::commands::pomodoro::{CycleOverrides, PomodoroAction};
use cadence::commands::records::RecordsAction;
use cadence::commands::timer::TimerAction;
use cadence::commands::GlobalOptions;
use cadence::logging::{init_tracing, LogFormat};
use cadence::types::SessionKind;

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "Focus, break, and leisure timers that survive restarts",
    long_about = "Cadence keeps timers and record collections in sync with a local store. Timers are anchored to wall-clock time, so a session keeps counting while cadence is not running."
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Enable debug mode for sync drift diagnostics
    #[arg(long, value_name = "VERBOSITY", global = true)]
    debug: Option<Option<String>>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Leisure or study countdown timer
    Timer {
        /// Session kind: leisure or study
        #[arg(short, long, default_value = "leisure")]
        kind: SessionKind,

        #[command(subcommand)]
        action: TimerCommand,
    },

    /// Pomodoro focus/break cycles
    Pomodoro {
        #[command(subcommand)]
        action: PomodoroCommand,
    },

    /// List and edit records of a collection
    Records {
        #[command(subcommand)]
        action: RecordsCommand,
    },

    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum TimerCommand {
    /// Start a timer (e.g. 90s, 25m, 1h30m)
    Start {
        /// Duration; defaults to leisure.default_minutes
        duration: Option<String>,

        /// Activity label
        #[arg(short, long)]
        activity: Option<String>,
    },
    /// Pause the running timer
    Pause,
    /// Resume a paused timer
    Resume,
    /// Cancel the timer
    Cancel,
    /// Restart the timer from its full duration
    Restart,
    /// Show remaining time
    Status,
    /// Show a live progress bar until the timer ends
    Watch,
}

#[derive(Subcommand)]
enum PomodoroCommand {
    /// Start a cycle and follow it in the foreground
    Run {
        /// Focus duration (overrides config)
        #[arg(long)]
        focus: Option<String>,

        /// Short break duration
        #[arg(long)]
        short_break: Option<String>,

        /// Long break duration
        #[arg(long)]
        long_break: Option<String>,

        /// Number of focus/break pairs
        #[arg(short, long)]
        cycles: Option<u32>,

        /// Long break after every N completed focus sessions
        #[arg(long)]
        long_break_every: Option<u32>,

        /// Activity label
        #[arg(short, long)]
        activity: Option<String>,
    },
    /// Show the current phase
    Status,
    /// Move to the next phase now
    Skip,
    /// Pause the current phase
    Pause,
    /// Resume the current phase
    Resume,
    /// Stop the cycle
    Stop,
}

#[derive(Subcommand)]
enum RecordsCommand {
    /// List records
    List {
        /// Collection name
        collection: String,

        /// Sort by field
        #[arg(short, long)]
        sort: Option<String>,

        /// Sort descending
        #[arg(long)]
        desc: bool,

        /// Newest first
        #[arg(long)]
        newest_first: bool,
    },
    /// Add a record from field=value pairs
    Add {
        collection: String,
        fields: Vec<String>,
    },
    /// Update fields of a record
    Update {
        collection: String,
        id: String,
        fields: Vec<String>,
    },
    /// Remove a record
    Remove { collection: String, id: String },
}

fn main() {
    let cli = Cli::parse();
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(cli.verbose, format);

    let options = GlobalOptions { debug: cli.debug };

    match cli.command {
        Command::Timer { kind, action } => {
            let action = match action {
                TimerCommand::Start { duration, activity } => {
                    TimerAction::Start { duration, activity }
                }
                TimerCommand::Pause => TimerAction::Pause,
                TimerCommand::Resume => TimerAction::Resume,
                TimerCommand::Cancel => TimerAction::Cancel,
                TimerCommand::Restart => TimerAction::Restart,
                TimerCommand::Status => TimerAction::Status,
                TimerCommand::Watch => TimerAction::Watch,
            };
            if let Err(e) = commands::timer::run(&options, kind, action) {
                eprintln!("Timer error: {}", e);
                std::process::exit(1);
            }
        }
        Command::Pomodoro { action } => {
            let action = match action {
                PomodoroCommand::Run {
                    focus,
                    short_break,
                    long_break,
                    cycles,
                    long_break_every,
                    activity,
                } => PomodoroAction::Run {
                    overrides: CycleOverrides {
                        focus,
                        short_break,
                        long_break,
                        cycles,
                        long_break_every,
                    },
                    activity,
                },
                PomodoroCommand::Status => PomodoroAction::Status,
                PomodoroCommand::Skip => PomodoroAction::Skip,
                PomodoroCommand::Pause => PomodoroAction::Pause,
                PomodoroCommand::Resume => PomodoroAction::Resume,
                PomodoroCommand::Stop => PomodoroAction::Stop,
            };
            if let Err(e) = commands::pomodoro::run(&options, action) {
                eprintln!("Pomodoro error: {}", e);
                std::process::exit(1);
            }
        }
        Command::Records { action } => {
            let (collection, action) = match action {
                RecordsCommand::List {
                    collection,
                    sort,
                    desc,
                    newest_first,
                } => (
                    collection,
                    RecordsAction::List {
                        sort,
                        descending: desc,
                        newest_first,
                    },
                ),
                RecordsCommand::Add { collection, fields } => {
                    (collection, RecordsAction::Add { fields })
                }
                RecordsCommand::Update {
                    collection,
                    id,
                    fields,
                } => (collection, RecordsAction::Update { id, fields }),
                RecordsCommand::Remove { collection, id } => {
                    (collection, RecordsAction::Remove { id })
                }
            };
            if let Err(e) = commands::records::run(&options, &collection, action) {
                eprintln!("Records error: {}", e);
                std::process::exit(1);
            }
        }
        Command::Config => {
            if let Err(e) = commands::config::run() {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        }
    }
}
