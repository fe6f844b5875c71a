//! The CLI session: connect, join, log until interrupted.

use anyhow::Result;
use serde_json::Value;
use tether_client::{Channel, Payload, Presence, Socket};
use tracing::{debug, info, warn};

use crate::config::{Config, TopicConfig};

/// Run a session until ctrl-c.
///
/// # Errors
///
/// Returns an error if the endpoint is invalid or the socket dies.
pub async fn run(config: Config) -> Result<()> {
    let socket = Socket::new(config.endpoint.clone(), config.socket_options())?;

    socket.on_open(|| info!("Socket open"));
    socket.on_close(|event| {
        info!(
            code = event.code,
            reason = %event.reason,
            clean = event.was_clean,
            "Socket closed"
        );
    });
    socket.on_error(|event| {
        warn!(
            transport = event.transport,
            connections = event.established_connections,
            "Socket error: {}",
            event.error
        );
    });
    socket.connect();

    let mut channels = Vec::with_capacity(config.topics.len());
    let mut presences = Vec::new();
    for topic in &config.topics {
        let (channel, presence) = join_topic(&socket, topic)?;
        channels.push(channel);
        presences.extend(presence);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for channel in &channels {
        channel.leave();
    }
    socket.disconnect(None, Some("shutdown")).await?;

    Ok(())
}

fn join_topic(socket: &Socket, topic: &TopicConfig) -> Result<(Channel, Option<Presence>)> {
    let channel = socket.channel(topic.name.clone(), Value::Object(topic.params.clone()));

    let name = topic.name.clone();
    channel.on_message(move |event, payload, _reference| {
        debug!(topic = %name, event, "{}", describe(&payload));
        payload
    });

    let name = topic.name.clone();
    channel.on_error(move |_| warn!(topic = %name, "Channel error"));

    let name = topic.name.clone();
    channel.on_close(move |_| info!(topic = %name, "Channel closed"));

    let presence = topic.presence.then(|| {
        let presence = Presence::new(&channel);
        let name = topic.name.clone();
        presence.on_join(move |key, prior, _| {
            if prior.is_none() {
                info!(topic = %name, key, "Presence joined");
            }
        });
        let name = topic.name.clone();
        presence.on_leave(move |key, remaining, _| {
            if remaining.metas.is_empty() {
                info!(topic = %name, key, "Presence left");
            }
        });
        let name = topic.name.clone();
        let roster = presence.clone();
        presence.on_sync(move || {
            info!(topic = %name, online = roster.list(|key, _| key.to_string()).len(), "Presence synced");
        });
        presence
    });

    let ok = topic.name.clone();
    let error = topic.name.clone();
    let timeout = topic.name.clone();
    channel
        .join()?
        .receive("ok", move |_| info!(topic = %ok, "Joined"))
        .receive("error", move |payload| {
            warn!(topic = %error, "Join refused: {}", describe(payload));
        })
        .receive("timeout", move |_| warn!(topic = %timeout, "Join timed out"));

    Ok((channel, presence))
}

/// One-line rendering of a payload for logs.
fn describe(payload: &Payload) -> String {
    match payload {
        Payload::Json(value) => value.to_string(),
        Payload::Binary(data) => format!("<{} bytes>", data.len()),
        Payload::BinaryReply { status, response } => {
            format!("{} <{} bytes>", status, response.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_describe_payload() {
        assert_eq!(describe(&Payload::Json(json!({"a": 1}))), r#"{"a":1}"#);
        assert_eq!(describe(&Payload::from(vec![1u8, 2, 3])), "<3 bytes>");
    }
}
