use clap::Parser;

#[derive(Parser)]
#[command(name = "acctflow_stub")]
#[command(about = "Downstream account service stub")]
struct Args {
    /// Listen address
    #[arg(short, long, env = "ACCTFLOW_STUB_ADDR", default_value = "0.0.0.0:8089")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("info")),
        )
        .init();
    acctflow_stub::serve(&args.listen).await
}
