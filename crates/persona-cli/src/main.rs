//! persona: command-line front end for the persona editor core.
//! Reads and writes persona documents (JSON or YAML, by extension).
//! Reports go to stdout as JSON, logs to stderr.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use persona_core::config::EditorConfig;

#[derive(Parser, Debug)]
#[command(name = "persona", version, about = "Validate, convert and edit persona documents")]
struct Cli {
    /// Editor settings file (defaults to persona.yaml in the working directory)
    #[arg(long, global = true, env = "PERSONA_CONFIG")]
    config: Option<PathBuf>,

    /// Log to stderr as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub(crate) enum Command {
    /// Check a document and print its warnings
    Validate { file: PathBuf },
    /// Re-export a document; the format follows the output extension
    Convert { input: PathBuf, output: PathBuf },
    /// Association network and collection stats
    Analyze { file: PathBuf },
    /// Write an empty persona
    New {
        output: PathBuf,
        /// Start from the sample persona instead
        #[arg(long)]
        sample: bool,
    },
    /// Rename a memory, following its associations
    RenameMemory {
        file: PathBuf,
        old_id: String,
        new_id: String,
        /// Write here instead of overwriting FILE
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove a memory and the associations that point at it
    RemoveMemory {
        file: PathBuf,
        id: String,
        /// Write here instead of overwriting FILE
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // A second init (tests) is harmless.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Editor settings for one-shot commands: no snapshots, no autosave.
fn load_config(path: Option<&PathBuf>) -> Result<EditorConfig> {
    let mut config = match path {
        Some(path) => EditorConfig::load(path)?,
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            EditorConfig::load_from_dir(&cwd)?
        }
    };
    config.persistence = false;
    config.autosave = false;
    Ok(config)
}

fn run(cli: Cli) -> Result<bool> {
    let config = load_config(cli.config.as_ref())?;
    debug!(?config, "Configuration loaded");
    commands::execute(cli.command, config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(line: &str) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("persona").chain(line.split_whitespace()))
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_commands() {
        let cli = parse("--log-json rename-memory p.yaml m1 m2 -o out.json").unwrap();
        assert!(cli.log_json);
        assert_eq!(
            cli.command,
            Command::RenameMemory {
                file: "p.yaml".into(),
                old_id: "m1".into(),
                new_id: "m2".into(),
                output: Some("out.json".into()),
            }
        );

        let cli = parse("new --sample persona.yaml --config c.yaml").unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.yaml")));
        assert_eq!(
            cli.command,
            Command::New {
                output: "persona.yaml".into(),
                sample: true
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("frobnicate x").is_err());
        assert!(parse("convert only-one.yaml").is_err());
        assert!(parse("validate p.yaml --verbose").is_err());
        assert!(parse("validate p.yaml --config").is_err());
    }
}
