use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use reconcile::{
    Json, OperationKind, OperationRecord, OperationStatus, Phase, Plan, RunObserver, RunResult,
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Colored one-character marker for an operation
pub fn symbol(operation: OperationKind) -> ColoredString {
    let symbol = operation.symbol();
    match operation {
        OperationKind::Create => symbol.green(),
        OperationKind::Update => symbol.yellow(),
        OperationKind::Replace => symbol.magenta(),
        OperationKind::Delete => symbol.red(),
        OperationKind::NoOp => symbol.dimmed(),
    }
}

/// Render a JSON value on one line; strings without quotes
pub fn format_value(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Plans and results
// ============================================================================

/// Print the operations of a plan, unchanged resources only when verbose
pub fn print_plan(plan: &Plan, verbose: bool) {
    header("Plan");
    for op in &plan.operations {
        if op.operation == OperationKind::NoOp && !verbose {
            continue;
        }
        let mut line = format!("  {} {} ({})", symbol(op.operation), op.name.bold(), op.kind);
        if op.retired {
            line.push_str(&format!(" {}", "replaced instance".dimmed()));
        }
        if let Some(id) = op.provider_id.as_deref().filter(|_| op.operation == OperationKind::Delete) {
            line.push_str(&format!(" {}", id.dimmed()));
        }
        println!("{line}");

        if !op.replacing.is_empty() {
            let order = if op.delete_before_replace {
                "delete, then create"
            } else {
                "create, then delete"
            };
            dim(&format!("    forces replacement: {} ({order})", op.replacing.join(", ")));
        } else if !op.changed.is_empty() {
            dim(&format!("    changed: {}", op.changed.join(", ")));
        }
    }
    println!();
    println!("  {}", plan.summary());
}

/// Print failures and counts after a run
pub fn print_result(result: &RunResult, what: &str) {
    println!();
    for failure in result.failures() {
        error(&format!("{} of {} failed: {}", failure.operation, failure.name, failure.error));
    }
    if !result.uncommitted.is_empty() {
        warn(&format!(
            "Not recorded in state (repaired on the next run): {}",
            result.uncommitted.join(", ")
        ));
    }
    if !result.skipped.is_empty() {
        dim(&format!("Skipped: {}", result.skipped.join(", ")));
    }
    if result.cancelled {
        warn("Cancelled before all operations were started");
    }

    let summary = result.summary();
    if result.is_success() {
        success(&format!("{what} complete: {summary}"));
    } else {
        error(&format!("{what} incomplete: {summary}"));
    }
}

pub fn print_outputs(outputs: &BTreeMap<String, Json>) {
    if outputs.is_empty() {
        return;
    }
    header("Outputs");
    for (name, value) in outputs {
        kv(name, &format_value(value));
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Progress bar per phase, one line per finished operation
pub struct ProgressObserver {
    bar: Option<ProgressBar>,
    quiet: bool,
}

impl ProgressObserver {
    pub fn new(quiet: bool) -> Self {
        Self { bar: None, quiet }
    }

    fn finish_bar(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn line(&self, text: String) {
        match &self.bar {
            Some(bar) => bar.suspend(|| println!("{text}")),
            None => println!("{text}"),
        }
    }
}

impl RunObserver for ProgressObserver {
    fn on_phase_start(&mut self, phase: Phase, total: usize) {
        self.finish_bar();
        if self.quiet {
            return;
        }
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_prefix(phase.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        self.bar = Some(bar);
    }

    fn on_operation_start(&mut self, name: &str, operation: OperationKind) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{operation} {name}"));
        }
    }

    fn on_operation_complete(&mut self, record: &OperationRecord) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
        if self.quiet || (record.operation == OperationKind::NoOp && record.status.is_success()) {
            return;
        }
        let elapsed = format!("{:.1}s", record.elapsed.as_secs_f64());
        let text = match &record.status {
            OperationStatus::Succeeded => format!(
                "  {} {} {} {}",
                symbol(record.operation),
                record.name,
                record.provider_id.as_deref().unwrap_or_default().dimmed(),
                elapsed.dimmed()
            ),
            OperationStatus::Failed { error } => {
                format!("  {} {} {}", "✗".red(), record.name, error.red())
            }
            OperationStatus::Uncommitted { error } => format!(
                "  {} {} {}",
                "⚠".yellow(),
                record.name,
                format!("not recorded: {error}").yellow()
            ),
        };
        self.line(text);
    }
}

impl Drop for ProgressObserver {
    fn drop(&mut self) {
        self.finish_bar();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&json!("192.168.10.52")), "192.168.10.52");
        assert_eq!(format_value(&json!(2048)), "2048");
        assert_eq!(format_value(&json!(["a"])), "[\"a\"]");
    }

    #[test]
    fn test_quiet_observer_has_no_bar() {
        let mut observer = ProgressObserver::new(true);
        observer.on_phase_start(Phase::Apply, 3);
        observer.on_operation_start("cluster", OperationKind::Create);
        assert!(observer.bar.is_none());
    }
}
