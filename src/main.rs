#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = challenge_server::run().await {
        eprintln!("challenge-server fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
