mod cli;
mod commands;
mod config;
mod plugin;
mod retry;
mod stack;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    /// Stack file path
    pub file: PathBuf,
    pub state_dir: Option<PathBuf>,
    /// `-c key=value` overrides for the stack's `[config]` table
    pub config: Vec<(String, String)>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        file: cli.file,
        state_dir: cli.state_dir,
        config: cli.config,
    };

    match cli.command {
        Command::Plan => commands::run::plan(&ctx),
        Command::Apply(args) => commands::run::apply(&ctx, args),
        Command::Destroy(args) => commands::run::destroy(&ctx, args),
        Command::Refresh => commands::run::refresh(&ctx),
        Command::Outputs { json } => commands::run::outputs(&ctx, json),
        Command::State(cmd) => commands::state::run(&ctx, cmd),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "virtstack", &mut io::stdout());
            Ok(())
        }
    }
}
