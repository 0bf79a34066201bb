mod args;
mod form20;

use clap::Parser;
use log::{debug, error, info};
use snafu::ErrorCompat;

fn main() {
    let args = args::Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();
    debug!("main: args: {:?}", args);

    match form20::run(&args) {
        Ok(outcome) if outcome.is_success() => {
            info!("main: {}", outcome.summary());
        }
        Ok(outcome) => {
            error!("main: {}", outcome.summary());
            eprintln!("{}", outcome.summary());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("An error occured: {}", e);
            if let Some(bt) = ErrorCompat::backtrace(&e) {
                eprintln!("{}", bt);
            }
            std::process::exit(1);
        }
    }
}
