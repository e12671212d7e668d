use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use defined_realtime_sdk::gql::{TokenPriceData, TokenPriceParams};
use defined_realtime_sdk::{FnSink, RealtimeClient};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_key = std::env::var("DEFINED_API_KEY")
        .map_err(|_| "set DEFINED_API_KEY to run this demo")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RealtimeClient::new(SecretString::new(api_key))?;
        let sink = FnSink::new(|data| match TokenPriceData::from_value(data) {
            Ok(update) => println!(
                "address={} network_id={} price_usd={} timestamp={}",
                update.on_update_price.address,
                update.on_update_price.network_id,
                update.on_update_price.price_usd,
                update.on_update_price.timestamp,
            ),
            Err(err) => eprintln!("unexpected payload: {err}"),
        })
        .with_error(|error| eprintln!("{error}"));

        let handle = client
            .subscribe_to_token_price_updates(
                &TokenPriceParams {
                    contract_address: Some(WETH.to_string()),
                    network_id: Some(1),
                },
                Arc::new(sink),
            )
            .await?;
        println!("subscribed id={}", handle.id());

        tokio::time::sleep(Duration::from_secs(30)).await;

        handle.unsubscribe();
        client.disconnect().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
