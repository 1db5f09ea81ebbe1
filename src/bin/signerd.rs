use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use log::error;
use tokensigner::config::Config;
use tokensigner::constants::{SIGNER_DEFAULT_CONFIG_FILE, SIGNER_SERVER_APP};
use tokensigner::server::start::start_signer_daemon;


/// The command line options of the signer daemon.
#[derive(clap::Parser)]
#[command(version, about = SIGNER_SERVER_APP)]
struct Options {
    /// Override the path to the config file
    #[arg(short, long, default_value = SIGNER_DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

fn main() {
    let options = Options::parse();

    let config = match Config::create(&options.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{e}");
            ::std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .max_blocking_threads(config.max_blocking_threads())
        .thread_name("signer-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Cannot start the runtime: {e}");
            ::std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(start_signer_daemon(config, None)) {
        error!("{SIGNER_SERVER_APP} failed: {e}");
        eprintln!("{SIGNER_SERVER_APP} failed: {e}");
        ::std::process::exit(1);
    }
}
