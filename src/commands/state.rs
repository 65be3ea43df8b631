//! `virtstack state` subcommands

use super::{confirm, Session};
use crate::cli::StateCommand;
use crate::ui;
use crate::Context;
use anyhow::{bail, Result};
use colored::Colorize;
use reconcile::{ResourceState, StateSnapshot};

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<()> {
    let session = Session::open(ctx, false)?;
    match cmd {
        StateCommand::List => list(&session),
        StateCommand::Show { name } => show(&session, &name),
        StateCommand::Rm { name, yes } => rm(&session, &name, yes),
    }
}

fn list(session: &Session) -> Result<()> {
    let snapshot = session.store().load()?;
    if snapshot.is_empty() {
        ui::info(&format!("No state in {}", session.state_dir.display()));
        return Ok(());
    }

    ui::header(&format!("Resources ({})", snapshot.resources.len()));
    let width = snapshot.resources.keys().map(String::len).max().unwrap_or(0);
    for state in snapshot.resources.values() {
        let marker = if snapshot.pending.contains_key(&state.name) {
            "!".yellow()
        } else {
            " ".normal()
        };
        println!(
            " {marker}{}  {:<18}  {}",
            format!("{:<width$}", state.name).bold(),
            state.kind,
            state.provider_id.dimmed()
        );
    }

    if !snapshot.retired.is_empty() {
        ui::header("Replaced, awaiting deletion");
        for state in &snapshot.retired {
            println!("  {} {} {}", state.name, state.kind, state.provider_id.dimmed());
        }
    }
    print_pending(&snapshot);
    Ok(())
}

fn print_pending(snapshot: &StateSnapshot) {
    if snapshot.pending.is_empty() {
        return;
    }
    ui::header("Interrupted operations");
    for (name, pending) in &snapshot.pending {
        println!(
            "  {} {} {} ({})",
            ui::symbol(pending.operation),
            name,
            pending.provider_id.as_deref().unwrap_or("no id").dimmed(),
            pending.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    ui::dim("Repaired on the next apply, destroy or refresh");
}

fn show(session: &Session, name: &str) -> Result<()> {
    let snapshot = session.store().load()?;
    let Some(state) = snapshot.get(name) else {
        bail!("No resource named '{name}' in state");
    };
    print_resource(state);
    Ok(())
}

fn print_resource(state: &ResourceState) {
    ui::header(&state.name);
    ui::kv("kind", &state.kind);
    ui::kv("id", &state.provider_id);
    if let Some(provider) = &state.provider {
        ui::kv("provider", provider);
    }
    if !state.dependencies.is_empty() {
        ui::kv("depends on", &state.dependencies.join(", "));
    }
    ui::kv("created", &state.created_at.to_rfc3339());
    ui::kv("updated", &state.updated_at.to_rfc3339());

    println!();
    println!("  {}", "arguments".dimmed());
    for (key, value) in &state.arguments {
        println!("    {key} = {}", ui::format_value(value));
    }
    println!("  {}", "outputs".dimmed());
    for (key, value) in &state.outputs {
        println!("    {key} = {}", ui::format_value(value));
    }
}

fn rm(session: &Session, name: &str, yes: bool) -> Result<()> {
    let store = session.store();
    let _lock = store.lock("state rm")?;
    let snapshot = store.load()?;
    let Some(state) = snapshot.get(name) else {
        bail!("No resource named '{name}' in state");
    };

    ui::warn(&format!(
        "{} ({}) will be forgotten but not deleted",
        state.name, state.provider_id
    ));
    if !confirm("Remove from state?", yes)? {
        ui::info("Nothing removed");
        return Ok(());
    }

    store.remove(name)?;
    ui::success(&format!("Removed {name} from state"));
    Ok(())
}
