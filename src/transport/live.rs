//! Live WebSocket transport
//!
//! Speaks the bidirectional streaming protocol of the hosted voice model:
//! a `setup` message on connect, `realtimeInput` media chunks upstream, and
//! `serverContent` turns downstream. The socket is split into a writer task
//! fed by a bounded queue and a reader task that turns server messages into
//! [`TransportEvent`]s.

use super::{
    FrameSink, OpenRequest, Transport, TransportChannel, TransportCloser, TransportEvent,
};
use crate::codec::EncodedFrame;
use crate::error::TransportError;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Outbound messages waiting for the socket
const OUTBOUND_BUFFER: usize = 32;

/// Server events waiting for the session manager
const EVENT_BUFFER: usize = 64;

/// WebSocket client for the live voice API
#[derive(Debug, Default)]
pub struct LiveTransport;

impl LiveTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Transport for LiveTransport {
    async fn open(&self, request: &OpenRequest) -> Result<TransportChannel, TransportError> {
        let key = request
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(TransportError::MissingCredential)?;

        tracing::info!(
            "Opening live session: model={}, voice={}",
            request.model,
            request.voice
        );

        let url = format!("{}?key={}", request.endpoint, key);
        let (ws_stream, _response) =
            match tokio::time::timeout(request.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
            {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
                Err(_) => return Err(TransportError::Timeout(request.connect_timeout.as_secs())),
            };

        let (mut ws_write, ws_read) = ws_stream.split();

        let setup = serde_json::to_string(&SetupMessage::from_request(request))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        ws_write.send(WsMessage::Text(setup)).await?;
        tracing::debug!("Sent session setup");

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let ready = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_loop(ws_write, out_rx));
        let reader = tokio::spawn(read_loop(ws_read, event_tx, ready.clone()));

        Ok(TransportChannel {
            sender: Arc::new(LiveFrameSink {
                tx: out_tx.clone(),
                ready,
            }),
            events: event_rx,
            closer: Box::new(LiveCloser {
                tx: Some(out_tx),
                reader: Some(reader),
                writer: Some(writer),
            }),
        })
    }

    fn name(&self) -> &'static str {
        "live"
    }
}

/// Forward queued messages to the socket; a close frame ends the task
async fn write_loop<S>(mut ws_write: S, mut rx: mpsc::Receiver<WsMessage>)
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, WsMessage::Close(_));
        if let Err(e) = ws_write.send(message).await {
            tracing::debug!("Live socket write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
}

/// Translate server messages into events until the socket ends
async fn read_loop<S>(mut ws_read: S, events: mpsc::Sender<TransportEvent>, ready: Arc<AtomicBool>)
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(message) = ws_read.next().await {
        let text = match message {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!("Ignoring non-UTF-8 binary message");
                    continue;
                }
            },
            Ok(WsMessage::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.into_owned())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by server".to_string());
                let _ = events.send(TransportEvent::Closed { reason }).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.into())).await;
                return;
            }
        };

        let parsed = match parse_server_message(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Ignoring malformed server message: {}", e);
                continue;
            }
        };

        for event in parsed {
            if matches!(event, TransportEvent::Ready) {
                ready.store(true, Ordering::Release);
            }
            if events.send(event).await.is_err() {
                return;
            }
        }
    }

    let _ = events
        .send(TransportEvent::Closed {
            reason: "stream ended".to_string(),
        })
        .await;
}

/// Outbound half: encodes frames as `realtimeInput` messages
struct LiveFrameSink {
    tx: mpsc::Sender<WsMessage>,
    ready: Arc<AtomicBool>,
}

impl FrameSink for LiveFrameSink {
    fn send_frame(&self, frame: EncodedFrame) -> Result<(), TransportError> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(TransportError::NotReady);
        }

        let (data, mime_type) = frame.into_parts();
        let message = RealtimeInputMessage {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob { mime_type, data }],
            },
        };
        let json =
            serde_json::to_string(&message).map_err(|e| TransportError::Protocol(e.to_string()))?;

        self.tx.try_send(WsMessage::Text(json)).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Dropped("outbound queue full".into()),
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

struct LiveCloser {
    tx: Option<mpsc::Sender<WsMessage>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl TransportCloser for LiveCloser {
    fn close(&mut self) -> Result<(), TransportError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        let result = tx
            .try_send(WsMessage::Close(None))
            .map_err(|_| TransportError::Closed);

        // A writer that cannot take the close frame is stuck or gone
        if result.is_err() {
            if let Some(writer) = self.writer.take() {
                writer.abort();
            }
        }

        tracing::debug!("Live transport closed");
        result
    }
}

impl Drop for LiveCloser {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// Wire format

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<Content>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

impl SetupMessage {
    fn from_request(request: &OpenRequest) -> Self {
        Self {
            setup: Setup {
                model: request.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec![request.modality.as_str()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: request.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![Part {
                        text: Some(request.system_instruction.clone()),
                        inline_data: None,
                    }],
                },
            },
        }
    }
}

/// Decode one server message into events, in wire order
///
/// Unknown message kinds decode to no events.
pub fn parse_server_message(text: &str) -> Result<Vec<TransportEvent>, TransportError> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| TransportError::Protocol(e.to_string()))?;

    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(TransportEvent::Ready);
    }

    if let Some(content) = message.server_content {
        // An interrupted turn carries no audio worth playing
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        } else if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    events.push(TransportEvent::Segment(EncodedFrame::new(
                        blob.data,
                        blob.mime_type,
                    )));
                }
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(TransportEvent::Text(text));
                }
            }
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ResponseModality;
    use std::time::Duration;

    fn request() -> OpenRequest {
        OpenRequest {
            endpoint: "wss://example.invalid/live".into(),
            model: "models/test-live".into(),
            modality: ResponseModality::Audio,
            voice: "Aoede".into(),
            system_instruction: "Be brief.".into(),
            api_key: Some("secret".into()),
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_setup_message_shape() {
        let json = serde_json::to_value(SetupMessage::from_request(&request())).unwrap();
        let setup = &json["setup"];

        assert_eq!(setup["model"], "models/test-live");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Aoede"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert!(setup["systemInstruction"]["parts"][0]
            .get("inlineData")
            .is_none());
    }

    #[test]
    fn test_parse_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(events, vec![TransportEvent::Ready]);
    }

    #[test]
    fn test_parse_model_turn_in_order() {
        let text = r#"{"serverContent":{"modelTurn":{"parts":[
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}},
            {"text":"Hello"},
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQA="}}
        ]}}}"#;

        let events = parse_server_message(text).unwrap();
        assert_eq!(
            events,
            vec![
                TransportEvent::Segment(EncodedFrame::new("AAA=", "audio/pcm;rate=24000")),
                TransportEvent::Text("Hello".into()),
                TransportEvent::Segment(EncodedFrame::new("AQA=", "audio/pcm;rate=24000")),
            ]
        );
    }

    #[test]
    fn test_parse_interrupted() {
        let events = parse_server_message(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(events, vec![TransportEvent::Interrupted]);
    }

    #[test]
    fn test_parse_turn_complete() {
        let events = parse_server_message(r#"{"serverContent":{"turnComplete":true}}"#).unwrap();
        assert_eq!(events, vec![TransportEvent::TurnComplete]);
    }

    #[test]
    fn test_unknown_message_yields_nothing() {
        let events = parse_server_message(r#"{"usageMetadata":{"totalTokenCount":12}}"#).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_malformed_message_is_protocol_error() {
        assert!(matches!(
            parse_server_message("not json"),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_realtime_input_shape() {
        let message = RealtimeInputMessage {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: "audio/pcm;rate=16000".into(),
                    data: "AAA=".into(),
                }],
            },
        };
        let json = serde_json::to_value(message).unwrap();
        assert_eq!(
            json["realtimeInput"]["mediaChunks"][0]["mimeType"],
            "audio/pcm;rate=16000"
        );
        assert_eq!(json["realtimeInput"]["mediaChunks"][0]["data"], "AAA=");
    }

    #[tokio::test]
    async fn test_sink_rejects_frames_before_ready() {
        let (tx, mut rx) = mpsc::channel(1);
        let ready = Arc::new(AtomicBool::new(false));
        let sink = LiveFrameSink {
            tx,
            ready: ready.clone(),
        };

        assert_eq!(
            sink.send_frame(EncodedFrame::new("AAA=", "audio/pcm;rate=16000")),
            Err(TransportError::NotReady)
        );

        ready.store(true, Ordering::Release);
        sink.send_frame(EncodedFrame::new("AAA=", "audio/pcm;rate=16000"))
            .unwrap();
        assert!(matches!(rx.recv().await, Some(WsMessage::Text(_))));

        // Queue of one is now full
        sink.send_frame(EncodedFrame::new("AQA=", "audio/pcm;rate=16000"))
            .unwrap();
        assert!(matches!(
            sink.send_frame(EncodedFrame::new("AgA=", "audio/pcm;rate=16000")),
            Err(TransportError::Dropped(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_connecting() {
        let mut request = request();
        request.api_key = Some("  ".into());
        let result = LiveTransport::new().open(&request).await;
        assert!(matches!(result, Err(TransportError::MissingCredential)));
    }

    #[tokio::test]
    async fn test_read_loop_reports_close_reason() {
        let messages = vec![
            Ok(WsMessage::Text(r#"{"setupComplete":{}}"#.to_string())),
            Ok(WsMessage::Close(Some(tungstenite::protocol::CloseFrame {
                code: tungstenite::protocol::frame::coding::CloseCode::Policy,
                reason: "API key not valid".into(),
            }))),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        let ready = Arc::new(AtomicBool::new(false));

        read_loop(futures_util::stream::iter(messages), tx, ready.clone()).await;

        assert!(ready.load(Ordering::Acquire));
        assert_eq!(rx.recv().await, Some(TransportEvent::Ready));
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Closed {
                reason: "API key not valid".into()
            })
        );
    }
}
