use crate::stack::parse_key_val;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use reconcile::ReplaceCleanup;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "virtstack")]
#[command(version)]
#[command(about = "Declarative provisioning of libvirt virtual machines", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Stack file describing the desired resources
    #[arg(
        short,
        long,
        global = true,
        env = "VIRTSTACK_FILE",
        default_value = "stack.toml"
    )]
    pub file: PathBuf,

    /// Directory holding state.json (default: .virtstack next to the stack file)
    #[arg(long, global = true, env = "VIRTSTACK_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Set a stack config value (repeatable)
    #[arg(short, long = "config", global = true, value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub config: Vec<(String, String)>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Plan,

    /// Create, update, replace and delete resources to match the stack file
    Apply(ApplyArgs),

    /// Delete every resource recorded in state
    Destroy(DestroyArgs),

    /// Re-read recorded resources and record drift
    Refresh,

    /// Print stack outputs from the recorded state
    Outputs {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or edit recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Apply / Destroy
// ============================================================================

#[derive(Parser)]
pub struct ApplyArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Operations run in parallel
    #[arg(short, long, env = "VIRTSTACK_JOBS")]
    pub jobs: Option<usize>,

    /// When old instances of create-before-delete replacements are removed
    #[arg(long, value_enum)]
    pub replace_cleanup: Option<CleanupArg>,
}

#[derive(Parser)]
pub struct DestroyArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Operations run in parallel
    #[arg(short, long, env = "VIRTSTACK_JOBS")]
    pub jobs: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CleanupArg {
    /// After all declared resources were processed
    Deferred,
    /// Right after each replacement was created
    Immediate,
}

impl From<CleanupArg> for ReplaceCleanup {
    fn from(arg: CleanupArg) -> Self {
        match arg {
            CleanupArg::Deferred => Self::Deferred,
            CleanupArg::Immediate => Self::Immediate,
        }
    }
}

// ============================================================================
// State Commands
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded resources
    List,

    /// Show one recorded resource
    Show {
        /// Logical name of the resource
        name: String,
    },

    /// Forget a resource without deleting it
    Rm {
        /// Logical name of the resource
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}
