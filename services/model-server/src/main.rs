use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use model_server::cli::{Cli, Command};
use model_server::{worker, PredictorCatalog};

fn main() -> ExitCode {
    let mut cli = Cli::parse();
    let result = match cli.command.take() {
        Some(Command::Worker(args)) => worker::run(args, &PredictorCatalog::with_builtins()),
        None => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building runtime")
            .and_then(|rt| rt.block_on(model_server::run(cli, PredictorCatalog::with_builtins()))),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
