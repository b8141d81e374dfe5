use bundlecache::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli::main().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
