//! Two peers on an in-memory relay and a loopback media network

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use rtcsig_client_core::prelude::*;
use rtcsig_session_core::engine::loopback::LoopbackEngine;
use rtcsig_session_core::sdp::MediaKind;
use rtcsig_session_core::signaling::memory::MemoryHub;
use rtcsig_session_core::ChannelConfig;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Args, Debug)]
pub struct P2PDemoArgs {
    /// Id of the publishing peer
    #[arg(long, default_value = "alice")]
    pub publisher: String,

    /// Id of the receiving peer
    #[arg(long, default_value = "bob")]
    pub receiver: String,

    /// Text sent once the stream is up
    #[arg(long, default_value = "hello from rtcsig")]
    pub message: String,

    /// Video codecs in preference order
    #[arg(long, value_delimiter = ',')]
    pub video_codecs: Vec<String>,

    /// Seconds to wait for each step
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,
}

pub async fn run(args: P2PDemoArgs) -> Result<()> {
    if args.publisher == args.receiver {
        bail!("publisher and receiver need different ids");
    }
    let step = Duration::from_secs(args.timeout);
    let channel = ChannelConfig::default().with_video_codecs(
        args.video_codecs
            .iter()
            .map(String::as_str)
            .collect::<Vec<&str>>(),
    );
    let config = P2PClientConfig::default().with_channel(channel);

    let hub = MemoryHub::new();
    let network = LoopbackEngine::new();
    let publisher = P2PClient::new(config.clone(), hub.channel(), Arc::new(network.sharing_network()))?;
    let receiver = P2PClient::new(config, hub.channel(), Arc::new(network))?;

    publisher.connect(&args.publisher).await?;
    receiver.connect(&args.receiver).await?;
    publisher.add_allowed_remote_id(args.receiver.as_str());
    receiver.add_allowed_remote_id(args.publisher.as_str());
    let mut publisher_events = publisher.event_stream();
    let mut events = receiver.event_stream();

    // Both sides offer at once; the larger id yields and answers
    let (publication, reply) = tokio::time::timeout(step, async {
        tokio::join!(
            publisher.publish(&args.receiver, demo_stream("camera")),
            receiver.publish(&args.publisher, demo_stream("reply")),
        )
    })
    .await
    .context("publish timed out")?;
    let publication = publication?;
    let reply = reply?;
    info!(stream = publication.id(), remote = publication.remote_id(), "Published");
    info!(stream = reply.id(), remote = reply.remote_id(), "Published");

    for (name, stream_events) in [
        (&args.receiver, &mut events),
        (&args.publisher, &mut publisher_events),
    ] {
        let added = wait_for(stream_events, step, |e| matches!(e, ClientEvent::StreamAdded { .. })).await?;
        if let ClientEvent::StreamAdded { stream, .. } = added {
            println!(
                "{} receives stream {} from {} ({} tracks)",
                name,
                stream.id,
                stream.origin,
                stream.tracks.len()
            );
        }
    }

    publisher.send(&args.receiver, args.message.as_str()).await?;
    let received = wait_for(&mut events, step, |e| matches!(e, ClientEvent::MessageReceived { .. })).await?;
    if let ClientEvent::MessageReceived { info, .. } = received {
        println!("{} got message from {}: {}", args.receiver, info.from, info.message);
    }

    let stats = publication.get_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    publisher.stop(&args.receiver).await?;
    wait_for(&mut events, step, |e| matches!(e, ClientEvent::SessionStopped { .. })).await?;
    println!("session between {} and {} stopped", args.publisher, args.receiver);

    publisher.disconnect().await?;
    receiver.disconnect().await?;
    Ok(())
}

fn demo_stream(id: &str) -> LocalStream {
    LocalStream::new(
        id,
        vec![
            MediaTrack::new(format!("{}-mic", id), MediaKind::Audio),
            MediaTrack::new(format!("{}-cam", id), MediaKind::Video),
        ],
    )
}

async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    timeout: Duration,
    matches: impl Fn(&ClientEvent) -> bool,
) -> Result<ClientEvent> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .context("timed out waiting for event")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_runs_to_completion() {
        let args = P2PDemoArgs {
            publisher: "alice".into(),
            receiver: "bob".into(),
            message: "hi".into(),
            video_codecs: vec!["VP8".into()],
            timeout: 5,
        };
        run(args).await.unwrap();
    }

    #[tokio::test]
    async fn test_same_ids_rejected() {
        let args = P2PDemoArgs {
            publisher: "alice".into(),
            receiver: "alice".into(),
            message: "hi".into(),
            video_codecs: Vec::new(),
            timeout: 1,
        };
        assert!(run(args).await.is_err());
    }
}
