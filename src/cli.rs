//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the taskmesh node.

use clap::{Parser, Subcommand};

/// taskmesh - peer-mesh job distribution node
///
/// Runs one mesh node: a coordinator with a fixed set of workers that
/// joins a loosely-coupled cluster over TCP, exchanges control and job
/// messages with peers, and balances load using self-reported activity
/// ratings.
#[derive(Parser, Debug)]
#[command(name = "taskmesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the node
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the node (joins the mesh and processes work)
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "TASKMESH_CONFIG")]
        config: Option<String>,

        /// Root server address override (host:port)
        #[arg(long, env = "TASKMESH_ROOT_ADDR")]
        root: Option<String>,

        /// Listen address override (host:port, empty string disables)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Measure round-trip time to a mesh node
    Ping {
        /// Target address (host:port)
        addr: String,

        /// Ping payload size in characters
        #[arg(short, long, default_value = "100")]
        size: usize,

        /// Timeout in milliseconds
        #[arg(short, long, default_value = "2000")]
        timeout_ms: u64,

        /// Shared transport secret (required for secured nodes)
        #[arg(long, env = "TASKMESH_SECRET")]
        secret: Option<String>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        // Verifies that the CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from(["taskmesh", "run"]);
        match cli.command {
            Commands::Run { config, root, listen } => {
                assert!(config.is_none());
                assert!(root.is_none());
                assert!(listen.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_config() {
        let cli = Cli::parse_from(["taskmesh", "run", "--config", "/path/to/node.toml"]);
        match cli.command {
            Commands::Run { config, .. } => {
                assert_eq!(config, Some("/path/to/node.toml".to_string()));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_root() {
        let cli = Cli::parse_from(["taskmesh", "run", "--root", "10.0.0.1:9400"]);
        match cli.command {
            Commands::Run { root, .. } => {
                assert_eq!(root, Some("10.0.0.1:9400".to_string()));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_ping_defaults() {
        let cli = Cli::parse_from(["taskmesh", "ping", "127.0.0.1:9400"]);
        match cli.command {
            Commands::Ping {
                addr,
                size,
                timeout_ms,
                secret,
            } => {
                assert_eq!(addr, "127.0.0.1:9400");
                assert_eq!(size, 100);
                assert_eq!(timeout_ms, 2000);
                assert!(secret.is_none());
            }
            _ => panic!("Expected Ping command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["taskmesh", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_quiet_flag() {
        let cli = Cli::parse_from(["taskmesh", "--quiet", "version"]);
        assert!(cli.quiet);
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::parse_from(["taskmesh", "config", "show"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Show { config },
            } => {
                assert!(config.is_none());
            }
            _ => panic!("Expected Config Show command"),
        }
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["taskmesh", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
