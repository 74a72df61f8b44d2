use std::path::PathBuf;

use clap::Parser;
use snafu::prelude::*;

use rook::dsl::{self, WorkflowDefinition};
use rook::tree::{self, NodeTree};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("I/O error reading {path}: {source}"))]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("{path}: {source}"))]
    Parse { path: String, source: dsl::Error },

    #[snafu(display("{path}: {source}"))]
    Build { path: String, source: tree::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Workflow document(s) to validate
    pub workflows: Vec<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

/// Parse each document and build its node tree; any failure is fatal, which
/// is exactly what the engine would do on first reference.
pub async fn handle_validate(args: ValidateArgs) -> Result<()> {
    for path in &args.workflows {
        let display = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .context(IoSnafu { path: display.clone() })?;
        let definition = WorkflowDefinition::from_yaml(&text)
            .context(ParseSnafu { path: display.clone() })?;
        let tree = NodeTree::build(&definition).context(BuildSnafu { path: display.clone() })?;
        println!(
            "{display}: ok ({} {} — {} nodes)",
            definition.document.name,
            definition.document.version,
            tree.len()
        );
    }
    Ok(())
}
