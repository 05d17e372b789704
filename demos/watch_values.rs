use std::error::Error;

use i3x_sdk::api::{I3xClient, DEFAULT_SERVER_URL};
use i3x_sdk::subscription::{channel_sink, SessionError, SessionOptions, Subscription};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let base_url = std::env::var("I3X_BASE_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
    let element_ids: Vec<String> = std::env::args().skip(1).collect();
    if element_ids.is_empty() {
        return Err("usage: watch_values <element-id>...".into());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = I3xClient::new(&base_url)?;
        let mut subscription = Subscription::create(client).await?;
        subscription.register(element_ids.as_slice(), None).await?;
        println!("subscription={} stream={}", subscription.id(), subscription.stream_url());

        let (sink, mut batches) = channel_sink();
        let mut session = subscription.live_session(
            SessionOptions::default(),
            sink,
            |error: SessionError| eprintln!("session error: {error}"),
        );
        session.start();

        loop {
            tokio::select! {
                batch = batches.recv() => {
                    let Some(batch) = batch else { break };
                    for update in batch {
                        println!(
                            "{} = {} quality={} at={}",
                            update.element_id,
                            update.value,
                            update.quality.as_deref().unwrap_or("-"),
                            update.timestamp.as_deref().unwrap_or("-"),
                        );
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        session.stop();
        subscription.delete().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
