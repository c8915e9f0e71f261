use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect, Message, WebSocket};

use super::TransportEvent;
use crate::{env_optional, log_line};

pub(crate) const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

// GUILD_MESSAGES + GUILD_MESSAGE_REACTIONS + MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = (1 << 9) | (1 << 10) | (1 << 15);

/// Read timeout on the underlying TCP stream. Every timed-out read is a
/// tick on which heartbeat deadlines get checked.
const READ_TICK: Duration = Duration::from_secs(1);

const FALLBACK_HEARTBEAT_MS: u64 = 41_250;

fn set_read_timeout(socket: &WebSocket<MaybeTlsStream<TcpStream>>) {
    let stream = match socket.get_ref() {
        MaybeTlsStream::Plain(stream) => stream,
        MaybeTlsStream::Rustls(stream) => stream.get_ref(),
        _ => return,
    };
    let _ = stream.set_read_timeout(Some(READ_TICK));
}

fn snowflake(value: Option<&serde_json::Value>) -> Option<u64> {
    match value? {
        serde_json::Value::String(text) => text.parse::<u64>().ok(),
        serde_json::Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

fn role_ids(value: Option<&serde_json::Value>) -> Vec<u64> {
    value
        .and_then(serde_json::Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(|role| snowflake(Some(role)))
                .collect()
        })
        .unwrap_or_default()
}

/// Turns one dispatch payload into the engine's event type. Everything the
/// session engine does not care about decodes to `None`.
pub(crate) fn decode_dispatch(
    event_type: &str,
    data: &serde_json::Value,
    self_id: u64,
) -> Option<TransportEvent> {
    match event_type {
        "MESSAGE_CREATE" => {
            let author_id = snowflake(data.pointer("/author/id"))?;
            let flagged_bot = data
                .pointer("/author/bot")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            Some(TransportEvent::MessageCreated {
                channel_id: snowflake(data.get("channel_id"))?,
                message_id: snowflake(data.get("id"))?,
                guild_id: snowflake(data.get("guild_id")),
                author_id,
                author_name: data
                    .pointer("/author/username")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                author_is_bot: flagged_bot || author_id == self_id,
                content: data
                    .get("content")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                author_roles: role_ids(data.pointer("/member/roles")),
            })
        }
        "MESSAGE_REACTION_ADD" => {
            let author_id = snowflake(data.get("user_id"))?;
            let flagged_bot = data
                .pointer("/member/user/bot")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            Some(TransportEvent::ReactionAdded {
                channel_id: snowflake(data.get("channel_id"))?,
                message_id: snowflake(data.get("message_id"))?,
                author_id,
                author_name: data
                    .pointer("/member/user/username")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                author_is_bot: flagged_bot || author_id == self_id,
                glyph: data
                    .pointer("/emoji/name")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                author_roles: role_ids(data.pointer("/member/roles")),
            })
        }
        "MESSAGE_REACTION_REMOVE" => {
            let author_id = snowflake(data.get("user_id"))?;
            Some(TransportEvent::ReactionRemoved {
                message_id: snowflake(data.get("message_id"))?,
                author_is_bot: author_id == self_id,
            })
        }
        "MESSAGE_DELETE" => Some(TransportEvent::MessageDeleted {
            message_id: snowflake(data.get("id"))?,
        }),
        _ => None,
    }
}

/// Connects to the gateway and feeds decoded events into `tx` until the
/// socket drops. Handles hello/identify, heartbeats and ping frames itself;
/// everything else is the main loop's problem. The caller reconnects by
/// spawning a fresh listener when it sees `Disconnected`.
pub(crate) fn spawn_gateway_listener(
    token: String,
    tx: mpsc::Sender<TransportEvent>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let url = env_optional("GSMCORD_GATEWAY_URL").unwrap_or_else(|| GATEWAY_URL.to_string());
        let mut socket = match connect(url.as_str()) {
            Ok((socket, _)) => socket,
            Err(err) => {
                let _ = tx.send(TransportEvent::Disconnected(format!("connect error: {err}")));
                return;
            }
        };
        set_read_timeout(&socket);

        let mut heartbeat_interval: Option<Duration> = None;
        let mut last_heartbeat = Instant::now();
        let mut sequence: Option<u64> = None;
        let mut self_id: u64 = 0;

        loop {
            if let Some(interval) = heartbeat_interval {
                if last_heartbeat.elapsed() >= interval {
                    let beat = json!({ "op": 1, "d": sequence });
                    if socket.send(Message::Text(beat.to_string().into())).is_err() {
                        let _ = tx.send(TransportEvent::Disconnected(
                            "heartbeat send failed".to_string(),
                        ));
                        break;
                    }
                    last_heartbeat = Instant::now();
                }
            }

            let message = match socket.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(err))
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(err) => {
                    let _ =
                        tx.send(TransportEvent::Disconnected(format!("read error: {err}")));
                    break;
                }
            };

            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Ping(data) => {
                    let _ = socket.send(Message::Pong(data));
                    continue;
                }
                Message::Close(frame) => {
                    let _ = tx.send(TransportEvent::Disconnected(format!(
                        "socket closed: {frame:?}"
                    )));
                    break;
                }
                _ => continue,
            };

            let payload = match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(payload) => payload,
                Err(err) => {
                    log_line("gateway", &format!("payload parse error: {err}"));
                    continue;
                }
            };
            if let Some(seq) = payload.get("s").and_then(serde_json::Value::as_u64) {
                sequence = Some(seq);
            }

            match payload.get("op").and_then(serde_json::Value::as_u64) {
                // Hello: learn the heartbeat interval, then identify.
                Some(10) => {
                    let interval_ms = payload
                        .pointer("/d/heartbeat_interval")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(FALLBACK_HEARTBEAT_MS);
                    heartbeat_interval = Some(Duration::from_millis(interval_ms));
                    last_heartbeat = Instant::now();

                    let identify = json!({
                        "op": 2,
                        "d": {
                            "token": token,
                            "intents": GATEWAY_INTENTS,
                            "properties": {
                                "os": "linux",
                                "browser": "gsmcord",
                                "device": "gsmcord",
                            },
                        },
                    });
                    if socket
                        .send(Message::Text(identify.to_string().into()))
                        .is_err()
                    {
                        let _ = tx.send(TransportEvent::Disconnected(
                            "identify send failed".to_string(),
                        ));
                        break;
                    }
                }
                // Immediate heartbeat request.
                Some(1) => {
                    let beat = json!({ "op": 1, "d": sequence });
                    let _ = socket.send(Message::Text(beat.to_string().into()));
                    last_heartbeat = Instant::now();
                }
                // Heartbeat ack.
                Some(11) => {}
                Some(7) => {
                    let _ = tx.send(TransportEvent::Disconnected(
                        "server requested reconnect".to_string(),
                    ));
                    break;
                }
                Some(9) => {
                    let _ = tx.send(TransportEvent::Disconnected(
                        "session invalidated".to_string(),
                    ));
                    break;
                }
                Some(0) => {
                    let event_type = payload
                        .get("t")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("");
                    if event_type == "READY" {
                        self_id = snowflake(payload.pointer("/d/user/id")).unwrap_or(0);
                        log_line("gateway", "connected and identified");
                        continue;
                    }
                    let data = payload.get("d").cloned().unwrap_or(serde_json::Value::Null);
                    if let Some(event) = decode_dispatch(event_type, &data, self_id) {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_create_decodes_author_and_roles() {
        let data = json!({
            "id": "111111111111111111",
            "channel_id": "222222222222222222",
            "guild_id": "333333333333333333",
            "content": "!!csgo",
            "author": { "id": "444444444444444444", "username": "vennie", "bot": false },
            "member": { "roles": ["555555555555555555", "666666666666666666"] }
        });
        let event = decode_dispatch("MESSAGE_CREATE", &data, 1).unwrap();
        match event {
            TransportEvent::MessageCreated {
                channel_id,
                guild_id,
                author_id,
                author_is_bot,
                content,
                author_roles,
                ..
            } => {
                assert_eq!(channel_id, 222222222222222222);
                assert_eq!(guild_id, Some(333333333333333333));
                assert_eq!(author_id, 444444444444444444);
                assert!(!author_is_bot);
                assert_eq!(content, "!!csgo");
                assert_eq!(author_roles.len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn own_messages_are_flagged_as_bot_traffic() {
        let data = json!({
            "id": "1", "channel_id": "2", "content": "x",
            "author": { "id": "444444444444444444", "username": "gsmcord" }
        });
        let event = decode_dispatch("MESSAGE_CREATE", &data, 444444444444444444).unwrap();
        let TransportEvent::MessageCreated { author_is_bot, .. } = event else {
            panic!("expected MessageCreated");
        };
        assert!(author_is_bot);
    }

    #[test]
    fn reaction_add_carries_the_glyph() {
        let data = json!({
            "user_id": "444444444444444444",
            "channel_id": "222222222222222222",
            "message_id": "111111111111111111",
            "emoji": { "name": "1️⃣" },
            "member": { "roles": ["555555555555555555"], "user": { "username": "vennie" } }
        });
        let event = decode_dispatch("MESSAGE_REACTION_ADD", &data, 1).unwrap();
        let TransportEvent::ReactionAdded { glyph, author_roles, .. } = event else {
            panic!("expected ReactionAdded");
        };
        assert_eq!(glyph, "1️⃣");
        assert_eq!(author_roles, vec![555555555555555555]);
    }

    #[test]
    fn reaction_remove_and_delete_decode_minimal_payloads() {
        let remove = json!({ "user_id": "9", "message_id": "111111111111111111" });
        assert!(matches!(
            decode_dispatch("MESSAGE_REACTION_REMOVE", &remove, 1),
            Some(TransportEvent::ReactionRemoved {
                message_id: 111111111111111111,
                author_is_bot: false,
            })
        ));

        let delete = json!({ "id": "111111111111111111" });
        assert!(matches!(
            decode_dispatch("MESSAGE_DELETE", &delete, 1),
            Some(TransportEvent::MessageDeleted {
                message_id: 111111111111111111,
            })
        ));
    }

    #[test]
    fn unknown_dispatches_are_ignored() {
        assert!(decode_dispatch("TYPING_START", &json!({}), 1).is_none());
    }
}
