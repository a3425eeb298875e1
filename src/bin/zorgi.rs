use anyhow::Result;
use zorgi::cli::{self, actions::server};

// Main function
#[tokio::main]
async fn main() -> Result<()> {
    let action = cli::start()?;

    server::handle(action).await?;

    Ok(())
}
