use clap::Parser;
use regscan::cli::{self, Args};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if let Err(err) = cli::run(args).await {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
