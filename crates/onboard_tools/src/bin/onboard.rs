#![forbid(unsafe_code)]

use std::env;
use std::fs;

use onboard_tools::psync_cli::{
    engine_config_from_env_value, execute_psync_command, HEURISTICS_ENV_VAR,
};

const USAGE: &str =
    "usage: onboard psync <snapshot|resolve> <state.json> | onboard psync edit <state.json> <contact|officer|owner> <edit.json>";

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() || args[0] != "psync" {
        return Err(USAGE.to_string());
    }

    let subcommand = args.get(1).ok_or_else(|| USAGE.to_string())?.as_str();
    let state_path = args.get(2).ok_or_else(|| USAGE.to_string())?;
    let state_json = read_file(state_path)?;
    let kind = args.get(3).map(String::as_str);
    let edit_json = match args.get(4) {
        Some(path) => Some(read_file(path)?),
        None => None,
    };

    let heuristics = env::var(HEURISTICS_ENV_VAR).ok();
    let config = engine_config_from_env_value(heuristics.as_deref());
    let output = execute_psync_command(
        config,
        subcommand,
        &state_json,
        kind,
        edit_json.as_deref(),
    )?;
    println!("{output}");
    Ok(())
}

fn read_file(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("failed to read {path}: {e}"))
}
