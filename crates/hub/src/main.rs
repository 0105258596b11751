#[tokio::main]
async fn main() -> anyhow::Result<()> {
    quay_hub::init_tracing();
    quay_hub::run().await
}
