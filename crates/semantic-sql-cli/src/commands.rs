use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "semantic-sql")]
#[command(about = "Rewrite pipeline driver for the semantic SQL dialect", long_about = None, version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(name = "rewrite", about = "Run a SQL statement through the unified rewrite pipeline")]
    Rewrite(RewriteArgs),
    #[command(name = "tokenize", about = "Print the lossless token stream for a SQL statement")]
    Tokenize(SqlArgs),
    #[command(name = "fingerprint", about = "Print the query fingerprint, template, and classification")]
    Fingerprint(SqlArgs),
}

#[derive(Debug, Parser)]
pub struct SqlArgs {
    /// SQL text, or `-` to read from stdin.
    pub sql: String,
    #[arg(default_value_t, short, long)]
    pub format: Format,
}

#[derive(Debug, Parser)]
pub struct RewriteArgs {
    /// SQL text, or `-` to read from stdin.
    pub sql: String,
    #[arg(default_value_t, short, long)]
    pub format: Format,
    /// Register the CLI's built-in demo functions (summarize/topics/semantic_case)
    /// so block/dimension/aggregate rewrites have something registered to match.
    #[arg(long, default_value_t = false)]
    pub demo_registry: bool,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum Format {
    #[default]
    Text,
    Json,
}
