mod collections;
mod run;
mod scripts;

use std::path::Path;

use runner::{RunnerConfig, RunnerResult, ScriptRunner};
use serde::Serialize;

pub use collections::{CollectionsCommand, run_collections};
pub use run::{RunArgs, run_script};
pub use scripts::{
    SaveArgs, ScriptRef, SearchArgs, run_delete, run_list, run_load, run_save, run_search,
};

/// Load the config (or defaults) and assemble the runner.
pub async fn open(config: Option<&Path>) -> RunnerResult<ScriptRunner> {
    let config = match config {
        Some(path) => runner::load_config(path).await?,
        None => RunnerConfig::default(),
    };
    runner::build(&config).await
}

/// Results go to stdout as pretty JSON; logs stay on stderr.
fn print_json<T: Serialize>(value: &T) -> RunnerResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
