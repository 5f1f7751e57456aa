use clap::Parser;
use tracing_subscriber::EnvFilter;

use magpie::cli::{self, MagpieCli};
use magpie::sync::summary::CancelToken;

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "magpie=debug" } else { "magpie=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = MagpieCli::parse();
    init_logging(cli.verbose);

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing in-flight checkpoint");
            interrupt.cancel();
        }
    });

    match cli::run(cli, cancel).await {
        Ok(output) => println!("{output}"),
        Err(err) => {
            eprintln!("error: {}", err.kind());
            eprintln!("  {err}");
            std::process::exit(err.exit_code());
        }
    }
}
