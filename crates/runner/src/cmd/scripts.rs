use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use runner::{DEFAULT_COLLECTION, RunnerResult, ScriptRunner};
use serde_json::json;

use super::print_json;

#[derive(Args)]
pub struct SaveArgs {
    /// Script name (sanitized to letters, digits, `-` and `_` for the file name)
    name: String,
    /// File holding the script source
    file: PathBuf,
    #[arg(long, default_value = DEFAULT_COLLECTION)]
    collection: String,
    #[arg(long, default_value = "")]
    description: String,
    /// Tag to attach (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,
}

/// A script identified by name within a collection.
#[derive(Args)]
pub struct ScriptRef {
    name: String,
    #[arg(long, default_value = DEFAULT_COLLECTION)]
    collection: String,
}

#[derive(Args)]
pub struct SearchArgs {
    /// Case-insensitive substring of a script name or tag
    query: String,
}

pub async fn run_save(runner: &ScriptRunner, args: SaveArgs) -> RunnerResult<ExitCode> {
    let source = tokio::fs::read_to_string(&args.file).await?;
    let saved = runner
        .save_script(
            &args.name,
            &source,
            &args.collection,
            &args.description,
            args.tags,
        )
        .await?;
    if !saved {
        eprintln!("collection '{}' does not exist", args.collection);
        return Ok(ExitCode::FAILURE);
    }
    print_json(&json!({ "saved": args.name, "collection": args.collection }))?;
    Ok(ExitCode::SUCCESS)
}

pub async fn run_load(runner: &ScriptRunner, args: ScriptRef) -> RunnerResult<ExitCode> {
    match runner.load_script(&args.name, &args.collection).await? {
        Some(script) => {
            print_json(&script)?;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("script '{}' not found in '{}'", args.name, args.collection);
            Ok(ExitCode::FAILURE)
        }
    }
}

pub async fn run_delete(runner: &ScriptRunner, args: ScriptRef) -> RunnerResult<ExitCode> {
    let deleted = runner.delete_script(&args.name, &args.collection).await?;
    print_json(&json!({ "deleted": deleted }))?;
    Ok(if deleted {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub async fn run_list(runner: &ScriptRunner) -> RunnerResult<()> {
    print_json(&runner.list_all_scripts().await?)
}

pub async fn run_search(runner: &ScriptRunner, args: SearchArgs) -> RunnerResult<()> {
    print_json(&runner.search_scripts(&args.query).await?)
}
