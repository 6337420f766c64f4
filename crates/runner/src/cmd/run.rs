use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use runner::{RunnerResult, ScriptRunner};
use tokio::io::AsyncReadExt;
use tracing::info;

use super::print_json;

#[derive(Args)]
pub struct RunArgs {
    /// Script file to execute, or `-` to read it from standard input
    file: PathBuf,
    /// Text served to the script's `input()` calls
    #[arg(long, conflicts_with = "input_file")]
    input: Option<String>,
    /// File whose contents are served to `input()`
    #[arg(long)]
    input_file: Option<PathBuf>,
    /// Wall-clock limit in seconds (overrides config)
    #[arg(long)]
    timeout_secs: Option<u64>,
}

pub async fn run_script(runner: &ScriptRunner, args: RunArgs) -> RunnerResult<ExitCode> {
    let source = if args.file.as_os_str() == "-" {
        let mut source = String::new();
        tokio::io::stdin().read_to_string(&mut source).await?;
        source
    } else {
        tokio::fs::read_to_string(&args.file).await?
    };
    let input = match (args.input, args.input_file) {
        (Some(text), _) => text,
        (None, Some(path)) => tokio::fs::read_to_string(path).await?,
        (None, None) => String::new(),
    };

    let result = match args.timeout_secs {
        Some(secs) => runner.execute_with_timeout(&source, &input, secs).await?,
        None => runner.execute(&source, &input).await,
    };
    info!(
        succeeded = result.succeeded(),
        elapsed_secs = result.elapsed_seconds(),
        "run finished"
    );
    print_json(&result)?;

    Ok(if result.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
