//! Standalone mock gateway: run this, then point `city-minder` (or any
//! other client) at the printed address.

use cmind_tests::MockGateway;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind = std::env::var("CMIND_GATEWAY_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:6789".to_string())
        .parse()?;

    let gateway = MockGateway::start(bind).await?;
    log::info!("Mock gateway serving on {:}", gateway.addr());

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down mock gateway");
    Ok(())
}
