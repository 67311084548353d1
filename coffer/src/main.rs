use std::process::ExitCode;

use clap::Parser;
use coffer::{App, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let mut app = match App::new(Cli::parse()) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("{:?}", e);
            return ExitCode::FAILURE;
        }
    };
    match app.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}
