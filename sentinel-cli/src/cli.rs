use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use sentinel_core::approval::MasterMode;

/// Drives one Sentinel cycle end-to-end against local, scripted
/// collaborators: a directory on disk stands in for the VFS's persistent
/// store, a patch bundle file stands in for the model's proposal, and a
/// shell command stands in for the test runner. Intended for manual
/// smoke-testing and scripting, not as a production agent front end.
#[derive(Parser, Debug)]
#[command(name = "sentinel", version)]
pub struct Cli {
    /// Natural-language goal for this cycle.
    pub goal: String,

    /// Directory whose files seed the in-memory VFS.
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Paths (relative to --root) to curate into the context bundle.
    /// Repeat the flag or comma-separate. When omitted, every file
    /// discovered under --root (respecting .gitignore) is curated.
    #[arg(long = "path", value_delimiter = ',')]
    pub curated_paths: Vec<String>,

    /// Path to a patch bundle file standing in for the model's proposal.
    /// Pass `-` to read the bundle from stdin.
    #[arg(long)]
    pub patch: PathBuf,

    /// Shell command run against a materialized copy of the post-apply
    /// snapshot to verify the proposed changes. Runs via `sh -c`.
    #[arg(long, default_value = "true")]
    pub verify_cmd: String,

    /// Master approval mode: `hitl` prompts on stdin for every approval,
    /// `autonomous` skips approvals entirely.
    #[arg(long, value_enum, default_value_t = MasterModeArg::Hitl)]
    pub master_mode: MasterModeArg,

    /// Optional TOML config file (see sentinel_core::config::Config).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Optional file to append one JSON line per reflection entry to.
    #[arg(long)]
    pub reflection_log: Option<PathBuf>,

    /// Specifies color settings for use in the output.
    #[arg(long = "color", value_enum, default_value_t = Color::Auto)]
    pub color: Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum MasterModeArg {
    Hitl,
    Autonomous,
}

impl From<MasterModeArg> for MasterMode {
    fn from(value: MasterModeArg) -> Self {
        match value {
            MasterModeArg::Hitl => MasterMode::Hitl,
            MasterModeArg::Autonomous => MasterMode::Autonomous,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum Color {
    Always,
    Never,
    #[default]
    Auto,
}
