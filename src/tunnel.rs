//! Event tunnel: a websocket from the parent into a child's API, forwarding
//! the child's events and messages onto the parent's event bus.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::events::EventSink;
use crate::logbook::LogBook;

/// Incoming frame: `{type, recipient?, content}`.
#[derive(Debug, Deserialize)]
struct TunnelFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    recipient: Option<Value>,
    #[serde(default)]
    content: Value,
}

/// Payload of a `forward` frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
enum Forwarded {
    Event {
        name: String,
        #[serde(default)]
        data: Value,
    },
    Message {
        message: String,
        #[serde(default)]
        args: Value,
    },
}

/// How long [`TunnelHandle::close_and_join`] waits for the close frame to go out.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Owner of a running tunnel task. Dropping it without closing it leaves the
/// task running.
#[derive(Debug)]
pub struct TunnelHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    /// Ask the read loop to send a close frame and exit. Does not wait.
    pub fn close(self) {
        self.cancel.cancel();
    }

    /// Close and wait for the task to finish, up to [`CLOSE_GRACE`].
    pub async fn close_and_join(self) {
        self.cancel.cancel();
        match tokio::time::timeout(CLOSE_GRACE, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Tunnel task ended abnormally: {}", e),
            Err(_) => log::warn!("Tunnel task did not finish within {:?}", CLOSE_GRACE),
        }
    }
}

pub struct TunnelParams {
    pub instance_id: String,
    pub url: String,
    pub api_key: String,
    /// Federation identifier forwarded events are attributed to.
    pub origin: String,
}

/// Spawn the tunnel task. Connection problems are written to the instance
/// log; they never fail the caller.
pub fn open(
    params: TunnelParams,
    logbook: Arc<LogBook>,
    events: Arc<dyn EventSink>,
) -> TunnelHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(params, logbook, events, cancel.clone()));
    TunnelHandle { cancel, task }
}

async fn run(
    params: TunnelParams,
    logbook: Arc<LogBook>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
) {
    let id = params.instance_id.as_str();

    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        connected = connect_async(params.url.as_str()) => connected,
    };
    let socket = match connected {
        Ok((socket, _)) => socket,
        Err(e) => {
            logbook.append(id, format!("Error: websocket connection failed: {e}"));
            return;
        }
    };
    logbook.append(id, "Websocket client connected");

    let (mut sink, mut stream) = socket.split();
    let login = json!({"type": "login", "content": {"token": params.api_key}});
    if let Err(e) = sink.send(WsMessage::Text(login.to_string().into())).await {
        logbook.append(id, format!("Error: failed to send login frame: {e}"));
        return;
    }

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(WsMessage::Text(text))) => {
                dispatch(&text, &params.origin, events.as_ref());
            }
            Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatch(text, &params.origin, events.as_ref()),
                Err(_) => log::debug!("Ignoring non-UTF-8 binary frame from {}", id),
            },
            Some(Ok(WsMessage::Ping(payload))) => {
                let _ = sink.send(WsMessage::Pong(payload)).await;
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                logbook.append(id, "Websocket connection closed");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                logbook.append(id, format!("Error: {e}"));
                break;
            }
        }
    }
}

/// Re-emit a `forward` frame on the event bus; every other frame type is ignored.
fn dispatch(text: &str, origin: &str, events: &dyn EventSink) {
    let frame: TunnelFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::debug!("Ignoring malformed tunnel frame: {e}");
            return;
        }
    };
    if frame.kind != "forward" {
        return;
    }

    match serde_json::from_value::<Forwarded>(frame.content) {
        Ok(Forwarded::Event { name, data }) => {
            events.publish_event(frame.recipient, &name, data, Some(origin));
        }
        Ok(Forwarded::Message { message, args }) => {
            events.publish_message(frame.recipient, &message, args, Some(origin));
        }
        Err(e) => log::debug!("Ignoring unsupported forward payload: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt as _, StreamExt as _};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::{dispatch, open, TunnelParams};
    use crate::events::{BroadcastEventBus, BusEvent, EventSink};
    use crate::logbook::LogBook;

    #[test]
    fn forward_event_is_published_with_origin() {
        let bus = BroadcastEventBus::new();
        let mut rx = bus.subscribe();
        let frame = json!({
            "type": "forward",
            "recipient": {"user": "bob"},
            "content": {"type": "event", "content": {"name": "note-added", "data": {"id": 7}}}
        });

        dispatch(&frame.to_string(), "acme", &bus);

        assert_eq!(
            rx.try_recv().unwrap(),
            BusEvent::Event {
                recipient: Some(json!({"user": "bob"})),
                name: "note-added".to_string(),
                data: json!({"id": 7}),
                origin: Some("acme".to_string()),
            }
        );
    }

    #[test]
    fn forward_message_is_published() {
        let bus = BroadcastEventBus::new();
        let mut rx = bus.subscribe();
        let frame = json!({
            "type": "forward",
            "content": {"type": "message", "content": {"message": "hello", "args": [1, 2]}}
        });

        dispatch(&frame.to_string(), "acme", &bus);

        match rx.try_recv().unwrap() {
            BusEvent::Message {
                message,
                args,
                origin,
                recipient,
            } => {
                assert_eq!(message, "hello");
                assert_eq!(args, json!([1, 2]));
                assert_eq!(origin.as_deref(), Some("acme"));
                assert!(recipient.is_none());
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[test]
    fn other_frames_are_ignored() {
        let bus = BroadcastEventBus::new();
        let mut rx = bus.subscribe();

        dispatch(r#"{"type":"status","content":{}}"#, "acme", &bus);
        dispatch(
            r#"{"type":"forward","content":{"type":"telemetry","content":{}}}"#,
            "acme",
            &bus,
        );
        dispatch("not json", "acme", &bus);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn logs_in_and_forwards_until_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let login = match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => serde_json::from_str::<Value>(&text).unwrap(),
                other => unreachable!("expected login text frame, got {other:?}"),
            };

            let forward = json!({
                "type": "forward",
                "content": {"type": "event", "content": {"name": "ping", "data": null}}
            });
            ws.send(WsMessage::Text(forward.to_string().into()))
                .await
                .unwrap();

            // wait for the client's close frame
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, WsMessage::Close(_)) {
                    break;
                }
            }
            login
        });

        let bus = Arc::new(BroadcastEventBus::new());
        let mut rx = bus.subscribe();
        let logbook = Arc::new(LogBook::new());
        let events: Arc<dyn EventSink> = Arc::clone(&bus) as Arc<dyn EventSink>;
        let handle = open(
            TunnelParams {
                instance_id: "acme".to_string(),
                url: format!("ws://{addr}/api"),
                api_key: "secret-key".to_string(),
                origin: "acme".to_string(),
            },
            Arc::clone(&logbook),
            events,
        );

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, BusEvent::Event { ref name, .. } if name == "ping"));

        tokio::time::timeout(Duration::from_secs(5), handle.close_and_join())
            .await
            .unwrap();
        let login = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(login, json!({"type": "login", "content": {"token": "secret-key"}}));
        assert!(logbook.contains("acme", "Websocket client connected"));
        assert!(!logbook.contains("acme", "Websocket connection closed"));
    }

    #[tokio::test]
    async fn connection_failure_is_logged_not_raised() {
        let port = crate::process::find_available_port().unwrap();
        let logbook = Arc::new(LogBook::new());
        let events: Arc<dyn EventSink> = Arc::new(BroadcastEventBus::new());

        let handle = open(
            TunnelParams {
                instance_id: "acme".to_string(),
                url: format!("ws://127.0.0.1:{port}/api"),
                api_key: "k".to_string(),
                origin: "acme".to_string(),
            },
            Arc::clone(&logbook),
            events,
        );

        for _ in 0..200 {
            if handle.task.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.task.is_finished());
        assert!(logbook.contains("acme", "Error: websocket connection failed"));
    }
}
