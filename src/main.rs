#[tokio::main]
async fn main() -> eyre::Result<()> {
    outpost::run().start().await
}
