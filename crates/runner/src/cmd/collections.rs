use std::process::ExitCode;

use clap::Subcommand;
use runner::{RunnerResult, ScriptRunner};
use serde_json::json;

use super::print_json;

#[derive(Subcommand)]
pub enum CollectionsCommand {
    /// Create an empty collection
    Create { name: String },
    /// Delete a collection and every script in it
    Delete { name: String },
    /// List collections in creation order
    List,
}

pub async fn run_collections(
    runner: &ScriptRunner,
    command: CollectionsCommand,
) -> RunnerResult<ExitCode> {
    let ok = match command {
        CollectionsCommand::Create { name } => {
            let created = runner.create_collection(&name).await?;
            print_json(&json!({ "created": created }))?;
            created
        }
        CollectionsCommand::Delete { name } => {
            let deleted = runner.delete_collection(&name).await?;
            print_json(&json!({ "deleted": deleted }))?;
            deleted
        }
        CollectionsCommand::List => {
            print_json(&runner.list_collections().await?)?;
            true
        }
    };
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
