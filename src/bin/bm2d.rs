use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = bm2::bm::cli::Args::parse();
    let home = bm2::bm::paths::BmHome::resolve(args.home.clone())?;
    bm2::bm::daemon::run_daemon(home, args).await
}
