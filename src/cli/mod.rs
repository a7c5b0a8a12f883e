//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod review;

pub use review::{AutoApprove, StdinReview};

#[derive(Parser, Debug)]
#[command(
    name = "trendforge",
    version,
    about = "Technology trend reports from hybrid retrieval and reviewed drafts",
    long_about = "trendforge indexes reference documents for hybrid keyword and semantic search, \
                  then runs a bounded plan, collect, analyze, review pipeline that turns a topic \
                  into a trend report."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/trendforge/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Configuration profile to apply
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Chunk, embed and index reference documents (JSON lines)
    Ingest {
        /// JSON-lines files, one document per line
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Index lexically only, skipping embeddings
        #[arg(long)]
        no_embed: bool,
    },

    /// Search the reference index
    Query {
        /// Search query text
        query: String,

        /// Maximum number of results
        #[arg(short = 'k', long)]
        limit: Option<usize>,

        /// Relevance/diversity trade-off in [0, 1]
        #[arg(long)]
        lambda: Option<f32>,

        /// Lexical weight in [0, 1]
        #[arg(long)]
        alpha: Option<f32>,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Generate a trend report for a topic
    Run {
        /// Report topic
        topic: String,

        /// Approve every plan and draft without prompting
        #[arg(long)]
        auto_approve: bool,

        /// Do not call the language model even if configured
        #[arg(long)]
        offline: bool,
    },

    /// Rebuild the index from stored source documents
    Rebuild,

    /// Show storage statistics
    Stats,

    /// List archived runs, or show one
    Runs {
        /// Run id to show in full
        run_id: Option<String>,

        /// Number of runs to list
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_query_flags() {
        let cli = Cli::try_parse_from([
            "trendforge",
            "query",
            "solid state batteries",
            "-k",
            "3",
            "--lambda",
            "0.7",
        ])
        .unwrap();

        match cli.command {
            Commands::Query {
                query,
                limit,
                lambda,
                alpha,
                json,
            } => {
                assert_eq!(query, "solid state batteries");
                assert_eq!(limit, Some(3));
                assert_eq!(lambda, Some(0.7));
                assert_eq!(alpha, None);
                assert!(!json);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ingest_requires_files() {
        assert!(Cli::try_parse_from(["trendforge", "ingest"]).is_err());
    }
}
