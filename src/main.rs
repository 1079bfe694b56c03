use clap::Parser;
use doc_reader::cli;
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    let args = cli::Args::parse();
    match cli::dispatch(args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{:#}", err);
            eprintln!("doc-reader: {:#}", err);
            ExitCode::from(1)
        }
    }
}
