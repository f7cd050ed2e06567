//! Frame loop for an established reverse connection
//!
//! One reader drains frames off the connection and drives per-channel
//! request assembly; completed requests run on their own task so a slow
//! handler never blocks the reader; all writes funnel through a single
//! mutex-guarded half of the connection.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::Router;
use bytes::{Bytes, BytesMut};
use http::header::CONTENT_LENGTH;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use pm_protocol::{
    encode_response_head, parse_command, ChannelId, CommandRequest, Frame, FrameCodec,
    ProtocolError,
};

use super::{Outcome, ReverseError};

/// A request being assembled on one channel, between its command frame
/// and the zero-length body terminator
struct ChannelState {
    request: CommandRequest,
    body: BytesMut,
}

/// Drive one connection until shutdown, a violation, or broker close
pub(crate) async fn run<S>(
    stream: S,
    introduction: String,
    router: Router,
    cancel: CancellationToken,
    max_frame_payload: usize,
) -> Outcome
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));

    // introduce ourselves before the broker says anything
    let intro = Frame::command(ChannelId::CONTROL, introduction.into_bytes());
    if let Err(e) = send_frame(&writer, intro).await {
        return Outcome::Recoverable(e.into());
    }

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut channels: HashMap<u16, ChannelState> = HashMap::new();

    let outcome = 'conn: loop {
        // drain every complete frame already buffered
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => {
                    if let Some(outcome) = handle_frame(
                        frame,
                        &mut channels,
                        &router,
                        &writer,
                        &cancel,
                        max_frame_payload,
                    ) {
                        break 'conn outcome;
                    }
                }
                Ok(None) => break,
                Err(e) => break 'conn Outcome::Recoverable(ReverseError::Protocol(e)),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break 'conn Outcome::Shutdown,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break 'conn Outcome::Recoverable(ReverseError::UnexpectedEof),
                Ok(_) => {}
                Err(e) => break 'conn Outcome::Recoverable(ReverseError::Transport(e)),
            },
        }
    };

    // close our side so dispatcher tasks still holding the writer fail
    // fast instead of writing into a replaced connection
    let _ = writer.lock().await.shutdown().await;

    outcome
}

/// Route one frame through the per-channel state machine
///
/// Returns Some when the connection must end.
fn handle_frame<W>(
    frame: Frame,
    channels: &mut HashMap<u16, ChannelState>,
    router: &Router,
    writer: &Arc<Mutex<WriteHalf<W>>>,
    cancel: &CancellationToken,
    max_frame_payload: usize,
) -> Option<Outcome>
where
    W: AsyncWrite + Send + 'static,
{
    let id = frame.channel.as_u16();

    if frame.command && frame.channel == ChannelId::CONTROL {
        return handle_control(&frame.payload);
    }

    if frame.command {
        if channels.contains_key(&id) {
            return Some(Outcome::Recoverable(ReverseError::Protocol(
                ProtocolError::CommandMidRequest(id),
            )));
        }
        let request = match parse_command(&frame.payload) {
            Ok(request) => request,
            Err(e) => return Some(Outcome::Recoverable(ReverseError::Protocol(e))),
        };
        tracing::debug!(
            "{} {} {} from broker",
            frame.channel,
            request.method,
            request.path
        );
        channels.insert(
            id,
            ChannelState {
                request,
                body: BytesMut::new(),
            },
        );
        return None;
    }

    // data frame: a channel only exists between command and terminator
    if frame.is_end_of_stream() {
        match channels.remove(&id) {
            Some(state) => spawn_dispatch(
                router.clone(),
                Arc::clone(writer),
                cancel.clone(),
                frame.channel,
                state.request,
                state.body.freeze(),
                max_frame_payload,
            ),
            None => {
                return Some(Outcome::Recoverable(ReverseError::Protocol(
                    ProtocolError::UnknownChannel(id),
                )))
            }
        }
    } else {
        match channels.get_mut(&id) {
            Some(state) => state.body.extend_from_slice(&frame.payload),
            None => {
                return Some(Outcome::Recoverable(ReverseError::Protocol(
                    ProtocolError::UnknownChannel(id),
                )))
            }
        }
    }

    None
}

/// Broker control commands arrive on channel 0
fn handle_control(payload: &[u8]) -> Option<Outcome> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();

    if let Some(reason) = text.strip_prefix("ERROR") {
        return Some(Outcome::Fatal(ReverseError::IntroductionRejected(
            reason.trim().to_string(),
        )));
    }
    if text == "RESET" {
        return Some(Outcome::Recoverable(ReverseError::BrokerReset));
    }

    tracing::debug!("ignoring broker control command: {}", text);
    None
}

/// Handle one completed request off the reader task
fn spawn_dispatch<W>(
    router: Router,
    writer: Arc<Mutex<WriteHalf<W>>>,
    cancel: CancellationToken,
    channel: ChannelId,
    request: CommandRequest,
    body: Bytes,
    max_frame_payload: usize,
) where
    W: AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        let response = match invoke_local(router, &request, body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    "local dispatch of {} {} failed: {}",
                    request.method,
                    request.path,
                    e
                );
                encode_response_head(
                    500,
                    "Internal Server Error",
                    &[(CONTENT_LENGTH.to_string(), "0".to_string())],
                )
            }
        };

        for frame in Frame::chunk_data(channel, &response, max_frame_payload) {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = send_frame(&writer, frame) => {
                    if let Err(e) = sent {
                        // the connection is gone; the reader has already
                        // noticed or will on its next read
                        tracing::debug!("response write on {} failed: {}", channel, e);
                        return;
                    }
                }
            }
        }
    });
}

/// Synthesize an in-process request and serialize the handler's response
/// into HTTP/1.1 wire form
async fn invoke_local(router: Router, request: &CommandRequest, body: Bytes) -> Result<Vec<u8>> {
    let mut builder = http::Request::builder()
        .method(request.method.as_str())
        .uri(&request.path);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let request = builder.body(Body::from(body))?;

    let response = router.oneshot(request).await?;
    let (parts, body) = response.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await?;

    let mut headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    if !parts.headers.contains_key(CONTENT_LENGTH) {
        headers.push((CONTENT_LENGTH.to_string(), body.len().to_string()));
    }

    let reason = parts.status.canonical_reason().unwrap_or("");
    let mut out = encode_response_head(parts.status.as_u16(), reason, &headers);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Encode and write one frame under the connection's write mutex
async fn send_frame<W>(writer: &Arc<Mutex<WriteHalf<W>>>, frame: Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Send,
{
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(frame, &mut buf)?;

    let mut writer = writer.lock().await;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
