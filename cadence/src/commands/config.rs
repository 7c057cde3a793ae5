//! Config command - Show current configuration

use colored::Colorize;
use std::path::Path;

use crate::config::{read_config_with_env, resolve_data_dir, resolve_paths, ENV_OVERRIDES};
use crate::duration_fmt::format_human;

pub fn run() -> anyhow::Result<()> {
    let paths = resolve_paths();

    println!("{}", "\nCadence Configuration\n".bold());

    println!("{}", "Config location:".dimmed());
    if Path::new(&paths.config_path).exists() {
        println!(
            "  {} {} ({:?})",
            "●".green(),
            paths.config_path,
            paths.config_type
        );
    } else {
        println!(
            "  {} {} (not found, using defaults)",
            "○".yellow(),
            paths.config_path
        );
    }

    match read_config_with_env(&paths.config_path) {
        Ok(config) => {
            let cycle = config.pomodoro.to_cycle_config();
            println!("{}", "\nCurrent settings:".dimmed());
            println!("  owner:              {}", config.owner.cyan());
            println!(
                "  data_dir:           {}",
                resolve_data_dir(&paths, &config.data_dir)
                    .display()
                    .to_string()
                    .cyan()
            );
            println!(
                "  debounce:           {}",
                format!("{}ms", config.sync.debounce_ms).cyan()
            );
            println!(
                "  heartbeat:          {}",
                format_human(config.sync.heartbeat()).cyan()
            );
            println!(
                "  staleness:          {}",
                format_human(config.sync.staleness()).cyan()
            );
            println!(
                "  max_write_attempts: {}",
                config.sync.max_write_attempts.to_string().cyan()
            );
            println!(
                "  pomodoro:           {} focus / {} short / {} long, {} cycles, long every {}",
                format_human(cycle.focus()).cyan(),
                format_human(cycle.short_break()).cyan(),
                format_human(cycle.long_break()).cyan(),
                cycle.cycle_count,
                cycle.long_break_every
            );
            println!(
                "  leisure default:    {}",
                format!("{}m", config.leisure.default_minutes).cyan()
            );
            println!(
                "  diagnostics:        {}",
                if config.diagnostics.enabled {
                    format!("on ({:?})", config.diagnostics.verbosity).green()
                } else {
                    "off".dimmed()
                }
            );

            println!("{}", "\nEnvironment overrides:".dimmed());
            let mut has_overrides = false;
            for var in &ENV_OVERRIDES {
                if let Ok(val) = std::env::var(var) {
                    println!("  {}={}", var, val.yellow());
                    has_overrides = true;
                }
            }
            if !has_overrides {
                println!("  {}", "(none)".dimmed());
            }

            println!();
        }
        Err(e) => {
            eprintln!("\n{}", "Error reading config:".red());
            eprintln!("  {}", format!("{}", e).dimmed());
            println!();
        }
    }

    Ok(())
}
