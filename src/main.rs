use syncbox::{init_tracing, load_config, run_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = load_config()?;
    run_server(config).await?;

    Ok(())
}
