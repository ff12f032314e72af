#[tokio::main]
async fn main() -> anyhow::Result<()> {
    weave::runner::run().await
}
