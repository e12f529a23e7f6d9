//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::BackendKind;

/// Echo operator
#[derive(Parser, Debug)]
#[command(name = "echo-operator")]
#[command(version)]
#[command(about = "Reconciles Echo resources into jobs that echo their message")]
#[command(
    long_about = "Runs the Echo controller against an in-process resource store. Each Echo gets one job that prints its message; the Echo status follows the job to Completed or Failed."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller
    Run {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the number of workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Override the job backend
        #[arg(long, value_enum)]
        backend: Option<BackendKind>,

        /// Namespace for seeded resources
        #[arg(short, long, default_value = "default")]
        namespace: String,

        /// Echo resource to create, as NAME=MESSAGE (repeatable)
        #[arg(short, long = "echo", value_parser = parse_echo_arg)]
        echo: Vec<EchoArg>,

        /// Exit once every seeded resource reached a terminal phase
        #[arg(long, default_value_t = false)]
        exit_when_settled: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// A resource given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoArg {
    pub name: String,
    pub message: String,
}

/// Parse `NAME=MESSAGE`. The message may itself contain `=`.
///
/// # Errors
///
/// Returns a message when the separator or the name is missing.
pub fn parse_echo_arg(raw: &str) -> Result<EchoArg, String> {
    let (name, message) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=MESSAGE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing resource name in '{raw}'"));
    }
    Ok(EchoArg {
        name: name.to_string(),
        message: message.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_echo_arg() {
        assert_eq!(
            parse_echo_arg("hello=hello world"),
            Ok(EchoArg {
                name: "hello".to_string(),
                message: "hello world".to_string(),
            })
        );
        assert_eq!(
            parse_echo_arg("eq=a=b").map(|arg| arg.message),
            Ok("a=b".to_string())
        );
        assert!(parse_echo_arg("no-separator").is_err());
        assert!(parse_echo_arg("=message").is_err());
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "echo-operator",
            "run",
            "--workers",
            "2",
            "--backend",
            "in-memory",
            "--echo",
            "a=first",
            "--echo",
            "b=second",
            "--exit-when-settled",
        ]);
        let Ok(Cli {
            command:
                Commands::Run {
                    workers,
                    backend,
                    namespace,
                    echo,
                    exit_when_settled,
                    config,
                },
        }) = cli
        else {
            unreachable!("run arguments should parse");
        };
        assert_eq!(workers, Some(2));
        assert_eq!(backend, Some(BackendKind::InMemory));
        assert_eq!(namespace, "default");
        assert_eq!(echo.len(), 2);
        assert!(exit_when_settled);
        assert!(config.is_none());
    }

    #[test]
    fn test_bad_echo_argument_is_rejected() {
        let cli = Cli::try_parse_from(["echo-operator", "run", "--echo", "oops"]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_config_subcommand() {
        let cli = Cli::try_parse_from(["echo-operator", "config", "--config", "op.toml"]);
        assert!(matches!(
            cli,
            Ok(Cli { command: Commands::Config { config: Some(path) } }) if path == PathBuf::from("op.toml")
        ));
    }
}
