use std::error::Error;

use fedistream::stream::channel::Channel;
use fedistream::stream::client::StreamClient;
use fedistream::stream::event::EventType;
use fedistream::stream::profile::BackendProfile;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let base_url = "https://mastodon.example".to_string();
    let access_token = "REPLACE_WITH_ACCESS_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = StreamClient::new(
            BackendProfile::mastodon("home", &base_url),
            Some(SecretString::new(access_token)),
        );
        let (_id, mut events) = client.subscribe_receiver(Channel::hashtag("home", "rust"))?;

        while let Some(event) = events.recv().await {
            match event.event_type {
                EventType::Update => println!(
                    "update id={} content={}",
                    event.payload["id"], event.payload["content"]
                ),
                EventType::Delete => println!("delete id={}", event.payload),
                EventType::Error => {
                    println!("stream ended: {}", event.payload["message"]);
                    break;
                }
                other => println!("{other:?}"),
            }
        }

        client.shutdown().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
