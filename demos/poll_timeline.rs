use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use fedistream::rest::HttpRestClient;
use fedistream::stream::channel::Channel;
use fedistream::stream::client::{StreamClient, StreamConfig};
use fedistream::stream::profile::BackendProfile;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let base_url = "https://friendica.example".to_string();
    let access_token = SecretString::new("REPLACE_WITH_ACCESS_TOKEN".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let rest = HttpRestClient::new(base_url.clone(), Some(access_token.clone()))?;
        let client = StreamClient::new(
            BackendProfile::friendica("friendica", &base_url),
            Some(access_token),
        )
        .with_rest(Arc::new(rest))
        .with_config(StreamConfig::default().with_poll_interval(Duration::from_secs(15)));

        client.subscribe(Channel::public_local("friendica"), |event| {
            println!(
                "{:?} id={} account={}",
                event.event_type, event.payload["id"], event.payload["account"]["acct"]
            );
        })?;

        tokio::signal::ctrl_c().await?;
        client.shutdown().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
