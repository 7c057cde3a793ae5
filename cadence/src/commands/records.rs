//! Records command - generic CRUD on a collection through the reconciler

use anyhow::{bail, Context as _};
use colored::Colorize;
use serde_json::{Map, Value};

use super::{runtime, AppContext, GlobalOptions};
use crate::cache::CacheOrder;
use crate::collection_sync::CollectionView;
use crate::types::EntityRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordsAction {
    List {
        sort: Option<String>,
        descending: bool,
        newest_first: bool,
    },
    Add {
        fields: Vec<String>,
    },
    Update {
        id: String,
        fields: Vec<String>,
    },
    Remove {
        id: String,
    },
}

/// Parse `field=value` pairs. Values that parse as JSON keep their type
/// (`amount=12.5`, `paid=true`); anything else is a string.
pub fn parse_fields(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut fields = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Expected field=value, got '{}'", pair);
        };
        let key = key.trim();
        if key.is_empty() || key == "id" {
            bail!("Invalid field name in '{}'", pair);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

fn order_for(action: &RecordsAction) -> CacheOrder {
    match action {
        RecordsAction::List {
            sort: Some(field),
            descending,
            ..
        } => CacheOrder::SortBy {
            field: field.clone(),
            descending: *descending,
        },
        RecordsAction::List {
            newest_first: true, ..
        } => CacheOrder::Prepend,
        _ => CacheOrder::Append,
    }
}

pub fn run(options: &GlobalOptions, collection: &str, action: RecordsAction) -> anyhow::Result<()> {
    let ctx = AppContext::load(options)?;
    let rt = runtime()?;
    rt.block_on(async {
        let handle = ctx
            .hub
            .collection(ctx.owner(), collection, order_for(&action))
            .with_context(|| format!("Failed to open collection {}", collection))?;
        let view = handle.wait_until_synced().await?;

        let result = match action {
            RecordsAction::List { .. } => {
                print_records(collection, &view);
                Ok(())
            }
            RecordsAction::Add { fields } => {
                let id = handle.add(parse_fields(&fields)?).await?;
                println!("{} Added {}", "✓".green(), id.cyan());
                Ok(())
            }
            RecordsAction::Update { id, fields } => {
                handle.update_fields(&id, parse_fields(&fields)?).await?;
                println!("{} Updated {}", "✓".green(), id.cyan());
                Ok(())
            }
            RecordsAction::Remove { id } => {
                handle.remove(&id).await?;
                println!("{} Removed {}", "✓".green(), id.cyan());
                Ok(())
            }
        };

        let flushed = handle.flush().await;
        ctx.finish().await;
        flushed?;
        result
    })
}

fn format_record(record: &EntityRecord) -> String {
    let fields: Vec<String> = record
        .fields
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{key}={s}"),
            other => format!("{key}={other}"),
        })
        .collect();
    fields.join("  ")
}

fn print_records(collection: &str, view: &CollectionView) {
    println!("{}", format!("\n{}\n", collection).bold());
    if view.records.is_empty() {
        println!("  {}", "(empty)".dimmed());
    }
    for record in &view.records {
        println!("  {}  {}", record.id.dimmed(), format_record(record));
    }
    if !view.failed.is_empty() {
        println!("{}", "\nFailed changes:".red());
        for failed in &view.failed {
            println!(
                "  {} {}",
                failed.record_id,
                failed.last_error.as_deref().unwrap_or("").dimmed()
            );
        }
    }
    println!();
}
