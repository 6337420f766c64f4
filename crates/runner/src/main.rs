mod cmd;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "sandbox-runner", version)]
struct Cli {
    /// Path to runner.yaml config file (built-in defaults when omitted)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a script file (or `-` for standard input) in the sandbox
    Run(cmd::RunArgs),
    /// Store a script in a collection
    Save(cmd::SaveArgs),
    /// Print a stored script and its metadata
    Load(cmd::ScriptRef),
    /// Remove a stored script
    Delete(cmd::ScriptRef),
    /// List every stored script
    List,
    /// Find scripts whose name or tags contain a query
    Search(cmd::SearchArgs),
    /// Manage collections
    #[command(subcommand)]
    Collections(cmd::CollectionsCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runner = match cmd::open(cli.config.as_deref()).await {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Run(args) => cmd::run_script(&runner, args).await,
        Command::Save(args) => cmd::run_save(&runner, args).await,
        Command::Load(args) => cmd::run_load(&runner, args).await,
        Command::Delete(args) => cmd::run_delete(&runner, args).await,
        Command::List => cmd::run_list(&runner).await.map(|()| ExitCode::SUCCESS),
        Command::Search(args) => cmd::run_search(&runner, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Collections(command) => cmd::run_collections(&runner, command).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
