use std::error::Error;
use std::time::Duration;

use phoenixd_sdk::config::{PhoenixdConfig, StreamClientOptions};
use phoenixd_sdk::relay::PaymentRelay;
use phoenixd_sdk::retry::ReconnectPolicy;
use phoenixd_sdk::stream::client::PaymentStream;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = PhoenixdConfig::new(SecretString::new("REPLACE_WITH_HTTP_PASSWORD".to_string()));
    let options = StreamClientOptions::default().with_reconnect_policy(
        ReconnectPolicy::exponential(
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_millis(250),
        ),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let stream = PaymentStream::new(config.connection_parameters()?, options)?;
        let relay = PaymentRelay::attach(&stream);

        // One receiver per invoice, keyed by the externalId used when creating it.
        let mut checkout = relay.register_session("REPLACE_WITH_EXTERNAL_ID");

        stream.start().await?;
        tokio::select! {
            payment = checkout.recv() => {
                if let Some(payment) = payment {
                    println!(
                        "paid payment_hash={} amount_sat={}",
                        payment.payment_hash, payment.amount_sat
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {}
        }

        drop(relay);
        stream.stop().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
