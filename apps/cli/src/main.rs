use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod context;
mod domains;

use context::{Context, OutputFormat};
use domains::{book::BookCommands, collection::CollectionCommands};

#[derive(Parser, Debug)]
#[command(name = "tc", about = "Share a collection of books through a synced folder")]
struct Cli {
	/// Local collection folder, defaults to the current directory
	#[arg(long, short = 'C', global = true)]
	collection: Option<PathBuf>,

	/// Output format
	#[arg(long, value_enum, default_value = "human", global = true)]
	format: OutputFormat,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Collection-wide operations
	#[command(subcommand)]
	Collection(CollectionCommands),
	/// Book operations
	#[command(subcommand)]
	Book(BookCommands),
}

fn init_logging() {
	// Console output goes to stderr so json output stays parseable
	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,tc_core=info"));

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_writer(std::io::stderr).with_target(false))
		.init();
}

#[tokio::main]
async fn main() -> Result<()> {
	init_logging();

	let cli = Cli::parse();
	let collection = match cli.collection {
		Some(path) => path,
		None => std::env::current_dir()?,
	};
	let ctx = Context::new(collection, cli.format);

	match cli.command {
		Commands::Collection(cmd) => domains::collection::run(&ctx, cmd).await,
		Commands::Book(cmd) => domains::book::run(&ctx, cmd),
	}
}
