//! plan, apply, destroy, refresh and outputs

use super::{confirm, Session};
use crate::cli::{ApplyArgs, DestroyArgs};
use crate::ui::{self, ProgressObserver};
use crate::Context;
use anyhow::{bail, Result};
use colored::Colorize;
use reconcile::{OperationKind, RunResult};

pub fn plan(ctx: &Context) -> Result<()> {
    let session = Session::open(ctx, true)?;
    let stack = session.stack()?;
    let engine = session.engine(session.settings.engine_options(None, None))?;

    let plan = engine.preview(&stack.declarations)?;
    ui::print_plan(&plan, ctx.verbose > 0);
    if !plan.has_changes() {
        ui::success("Infrastructure matches the stack file");
    }
    Ok(())
}

pub fn apply(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let session = Session::open(ctx, true)?;
    let stack = session.stack()?;
    let options = session
        .settings
        .engine_options(args.jobs, args.replace_cleanup.map(Into::into));
    log::info!(
        "Applying {} with {} jobs ({:?} replace cleanup)",
        stack.path.display(),
        options.jobs,
        options.replace_cleanup
    );
    let engine = session.engine(options)?;

    let plan = engine.preview(&stack.declarations)?;
    if !ctx.quiet {
        ui::print_plan(&plan, ctx.verbose > 0);
    }
    if plan.has_changes() && !confirm("Apply these changes?", args.yes)? {
        ui::info("Apply cancelled");
        return Ok(());
    }

    let mut observer = ProgressObserver::new(ctx.quiet);
    let result = engine.apply_with(&stack.declarations, &stack.outputs, &mut observer)?;
    drop(observer);

    finish(&result, "Apply")?;
    ui::print_outputs(&result.outputs);
    Ok(())
}

pub fn destroy(ctx: &Context, args: DestroyArgs) -> Result<()> {
    let session = Session::open(ctx, false)?;
    let engine = session.engine(session.settings.engine_options(args.jobs, None))?;

    let snapshot = engine.store().load()?;
    if snapshot.is_empty() {
        ui::info("Nothing recorded in state");
        return Ok(());
    }

    if !ctx.quiet {
        ui::header("Destroy");
        for state in snapshot.retired.iter().chain(snapshot.resources.values()) {
            println!(
                "  {} {} ({}) {}",
                ui::symbol(OperationKind::Delete),
                state.name.bold(),
                state.kind,
                state.provider_id.dimmed()
            );
        }
    }
    let count = snapshot.resources.len() + snapshot.retired.len();
    if !confirm(&format!("Delete {count} resources?"), args.yes)? {
        ui::info("Destroy cancelled");
        return Ok(());
    }

    let mut observer = ProgressObserver::new(ctx.quiet);
    let result = engine.destroy_with(&mut observer)?;
    drop(observer);

    finish(&result, "Destroy")
}

pub fn refresh(ctx: &Context) -> Result<()> {
    let session = Session::open(ctx, false)?;
    let engine = session.engine(session.settings.engine_options(None, None))?;

    let report = engine.refresh()?;
    for name in &report.updated {
        ui::warn(&format!("{name}: outputs changed outside virtstack"));
    }
    for name in &report.removed {
        ui::warn(&format!("{name}: no longer exists, removed from state"));
    }
    if report.has_drift() {
        ui::info(&format!(
            "Refreshed {} resources ({} changed, {} gone)",
            report.updated.len() + report.removed.len() + report.unchanged.len(),
            report.updated.len(),
            report.removed.len()
        ));
    } else {
        ui::success(&format!("No drift in {} resources", report.unchanged.len()));
    }
    Ok(())
}

pub fn outputs(ctx: &Context, json: bool) -> Result<()> {
    let session = Session::open(ctx, true)?;
    let stack = session.stack()?;
    let engine = session.engine(session.settings.engine_options(None, None))?;

    let values = engine.outputs(&stack.outputs)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else if values.is_empty() {
        ui::info("No outputs declared");
    } else {
        for (name, value) in &values {
            println!("{} = {}", name.bold(), ui::format_value(value));
        }
    }
    Ok(())
}

fn finish(result: &RunResult, what: &str) -> Result<()> {
    ui::print_result(result, what);
    if result.is_success() {
        return Ok(());
    }
    match &result.failed {
        Some(failure) => bail!(
            "{what} failed at {} ({})",
            failure.name,
            failure.operation
        ),
        None => bail!("{what} did not finish"),
    }
}
