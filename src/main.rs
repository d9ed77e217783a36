use exlink::core::config::{AccountConfig, ConnectivityConfig, Credentials};
use exlink::{
    Channel, ConnectivityRegistry, ExchangeFactory, ExchangeKind, MarketKind, SessionEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Streams public BTCUSDT trades from Binance for a few seconds. When
/// `BINANCE_API_KEY` and `BINANCE_SECRET_KEY` are set, also prints account balances.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let credentials = Credentials::from_env("binance").ok();
    let authenticated = credentials.is_some();
    let credentials = credentials.unwrap_or_else(Credentials::read_only);
    let config = ConnectivityConfig {
        accounts: vec![AccountConfig::new(
            "main",
            ExchangeKind::Binance,
            MarketKind::Spot,
            credentials,
        )],
    };
    let registry = ConnectivityRegistry::from_config(&config, &ExchangeFactory::new())?;
    let client = registry
        .get(ExchangeKind::Binance, "main")
        .ok_or_else(|| anyhow::anyhow!("binance client missing from registry"))?;

    let instruments = client.get_instruments().await?;
    info!(count = instruments.len(), "instruments loaded");

    let mut notices = client.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            info!(?notice, "session notice");
        }
    });

    let _handle = client
        .subscribe(
            Channel::Trades,
            Some("BTCUSDT"),
            Arc::new(|event: SessionEvent| match event {
                SessionEvent::Data(event) => info!(topic = %event.topic, payload = %event.payload, "trade"),
                SessionEvent::Gap(gap) => warn!(?gap, "sequence gap"),
            }),
        )
        .await?;

    if authenticated {
        match client.get_account().await {
            Ok(account) => {
                for balance in account.balances {
                    info!(asset = %balance.asset, free = %balance.free, locked = %balance.locked, "balance");
                }
            }
            Err(err) => warn!(error = %err, "account request failed"),
        }
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    registry.shutdown().await;
    Ok(())
}
