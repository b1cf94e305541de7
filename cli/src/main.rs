mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{GetCommand, InitCommand, ListCommand, PutCommand, TreeCommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "coffre",
    about = "Content-addressed encrypted backup store",
    long_about = "Coffre stores files as encrypted, deduplicated, content-addressed objects and restores them byte for byte"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short = 'R', long, env = "COFFRE_REPOSITORY", help = "Repository path")]
    repository: Option<String>,

    #[arg(long, env = "COFFRE_PASSWORD", help = "Repository password")]
    password: Option<String>,

    #[arg(short = 'j', long, help = "Number of concurrent tasks")]
    threads: Option<usize>,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new repository")]
    Init(InitCommand),

    #[command(about = "Store files and directories as a new snapshot")]
    Put(PutCommand),

    #[command(about = "Restore a stored object tree to a destination")]
    Get(GetCommand),

    #[command(about = "List snapshots")]
    List(ListCommand),

    #[command(about = "Walk the object tree under an id")]
    Tree(TreeCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Init(ref cmd) => cmd.run(&cli).await,
        Commands::Put(ref cmd) => cmd.run(&cli).await,
        Commands::Get(ref cmd) => cmd.run(&cli).await,
        Commands::List(ref cmd) => cmd.run(&cli).await,
        Commands::Tree(ref cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!("coffre={level}")))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default subscriber failed");
}
