use syncbox::supervisor::Supervisor;
use syncbox::{init_tracing, load_config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = load_config()?;
    Supervisor::new(config).run().await?;

    Ok(())
}
