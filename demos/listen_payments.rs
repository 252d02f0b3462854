use std::error::Error;

use phoenixd_sdk::config::{PhoenixdConfig, StreamClientOptions};
use phoenixd_sdk::stream::client::PaymentStream;
use phoenixd_sdk::stream::proto::NodeEvent;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = PhoenixdConfig::new(SecretString::new("REPLACE_WITH_HTTP_PASSWORD".to_string()))
        .with_host("http://127.0.0.1:9740");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let stream = PaymentStream::new(config.connection_parameters()?, StreamClientOptions::default())?;

        stream.subscribe(|payload| {
            match NodeEvent::from_text(payload)? {
                NodeEvent::PaymentReceived(payment) => println!(
                    "payment_hash={} amount_sat={} external_id={}",
                    payment.payment_hash,
                    payment.amount_sat,
                    payment.external_id.as_deref().unwrap_or("-"),
                ),
                NodeEvent::Unknown => println!("raw={payload}"),
            }
            Ok(())
        });

        stream.start().await?;
        stream
            .stop_on(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;

        Ok::<(), Box<dyn Error>>(())
    })
}
