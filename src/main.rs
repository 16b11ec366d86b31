use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fbidx::{Result, cmd, watch};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the fbidx application
#[derive(Parser)]
#[command(name = "fbidx")]
#[command(about = "Incremental multi-index file indexer")]
#[command(version)]
struct Cli {
   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands for fbidx
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Bring every index up to date with a directory")]
   Index {
      #[arg(help = "Directory to index (default: cwd)")]
      path: Option<PathBuf>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Print the values stored under a key")]
   Query {
      #[arg(help = "Index name")]
      index: String,

      #[arg(help = "Key to look up")]
      key: String,

      #[arg(long, help = "Indexed directory (default: cwd)")]
      path: Option<PathBuf>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "List files containing all of the given keys")]
   Files {
      #[arg(help = "Index name")]
      index: String,

      #[arg(required = true, help = "Keys that must all be present")]
      keys: Vec<String>,

      #[arg(long, help = "Indexed directory (default: cwd)")]
      path: Option<PathBuf>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Show what one file contributes to an index")]
   Data {
      #[arg(help = "Index name")]
      index: String,

      #[arg(help = "File to inspect")]
      file: PathBuf,

      #[arg(long, help = "Indexed directory (default: cwd)")]
      path: Option<PathBuf>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Show per-index state")]
   Status {
      #[arg(help = "Indexed directory (default: cwd)")]
      path: Option<PathBuf>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Discard and rebuild one index, or all of them")]
   Rebuild {
      #[arg(help = "Index name (default: all)")]
      index: Option<String>,

      #[arg(long, help = "Indexed directory (default: cwd)")]
      path: Option<PathBuf>,
   },

   #[command(about = "Index, then follow file changes until stdin closes")]
   Watch {
      #[arg(help = "Directory to watch (default: cwd)")]
      path: Option<PathBuf>,

      #[arg(
         long,
         default_value_t = watch::DEFAULT_DEBOUNCE.as_millis() as u64,
         help = "Debounce window in ms"
      )]
      debounce_ms: u64,
   },
}

fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
      .with_writer(std::io::stderr)
      .init();

   let cli = Cli::parse();
   if let Err(err) = run(cli) {
      eprintln!("{err}");
      std::process::exit(err.exit_code());
   }
}

fn run(cli: Cli) -> Result<()> {
   match cli.command {
      Cmd::Index { path, json } => cmd::index::execute(path, json),
      Cmd::Query { index, key, path, json } => cmd::query::values(&index, &key, path, json),
      Cmd::Files { index, keys, path, json } => cmd::query::files(&index, &keys, path, json),
      Cmd::Data { index, file, path, json } => cmd::query::data(&index, &file, path, json),
      Cmd::Status { path, json } => cmd::status::execute(path, json),
      Cmd::Rebuild { index, path } => cmd::rebuild::execute(index, path),
      Cmd::Watch { path, debounce_ms } => cmd::watch::execute(path, debounce_ms),
   }
}
