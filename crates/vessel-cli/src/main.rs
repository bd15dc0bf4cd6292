use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use vessel_core::ArtifactError;

mod cli;
mod dispatch;

use cli::VesselCli;
use dispatch::{CommandStatus, Outcome};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = VesselCli::parse();
    init_tracing(cli.trace, cli.verbose, cli.quiet);

    let code = match dispatch::execute(&cli) {
        Ok(outcome) => emit_output(&cli, &outcome)?,
        Err(err) if cli.json => emit_error_json(&err)?,
        Err(err) => return Err(eyre!("{err:?}")),
    };

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8, quiet: bool) {
    let level = if trace {
        "trace"
    } else if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("vessel={level},vessel_core={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn emit_output(cli: &VesselCli, outcome: &Outcome) -> Result<i32> {
    let code = match outcome.status {
        CommandStatus::Ok => 0,
        CommandStatus::Failed => 1,
    };

    if cli.json {
        let status = match outcome.status {
            CommandStatus::Ok => "ok",
            CommandStatus::Failed => "failed",
        };
        let payload = json!({
            "status": status,
            "message": outcome.message,
            "details": outcome.details,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if !cli.quiet && !outcome.message.is_empty() {
        println!("{}", outcome.message);
    }

    Ok(code)
}

/// Domain errors exit with 1, everything else with 2.
fn emit_error_json(err: &anyhow::Error) -> Result<i32> {
    let artifact_error = err.downcast_ref::<ArtifactError>();
    let payload = json!({
        "status": "error",
        "code": artifact_error.map(ArtifactError::code),
        "message": format!("{err:#}"),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(if artifact_error.is_some() { 1 } else { 2 })
}
