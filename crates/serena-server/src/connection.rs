//! One client socket bridged to one live session.
//!
//! Two pumps run per connection. The inbound pump decodes client frames
//! into live requests; the outbound pump is the only writer to the socket
//! and encodes live events plus notices from the inbound pump. When either
//! pump stops, the other is cancelled and awaited before the socket closes.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use serena_core::events::{LiveEvent, LiveRequest};
use serena_core::ids::SessionId;
use serena_engine::{LiveOptions, LiveSession};

use crate::error::PumpError;
use crate::frames::{decode_inbound, encode_event, OutboundFrame};
use crate::server::AppState;

const INTERNAL_ERROR: &str = "Internal server error. Please reconnect.";

type Sink = SplitSink<WebSocket, Message>;

enum Finished {
    Inbound(Result<Result<(), PumpError>, tokio::task::JoinError>),
    Outbound(Result<(Sink, Result<(), PumpError>), tokio::task::JoinError>),
}

#[instrument(skip(socket, state), fields(session_id = %session_id))]
pub async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: SessionId,
    options: LiveOptions,
) {
    info!(audio_output = options.audio_output, "client connected");
    let cancel = state.shutdown.child_token();
    let LiveSession {
        requests,
        events,
        task: live_task,
    } = state.live.start(session_id, options, cancel.child_token());

    let (ws_tx, ws_rx) = socket.split();
    let (notice_tx, notice_rx) = mpsc::channel(state.config.max_send_queue);

    let mut inbound = tokio::spawn(inbound_pump(ws_rx, requests, notice_tx, cancel.clone()));
    let mut outbound = tokio::spawn(outbound_pump(ws_tx, events, notice_rx, cancel.clone()));

    let finished = tokio::select! {
        r = &mut inbound => Finished::Inbound(r),
        r = &mut outbound => Finished::Outbound(r),
    };
    cancel.cancel();

    let (inbound_result, outbound_result) = match finished {
        Finished::Inbound(r) => (r, outbound.await),
        Finished::Outbound(r) => (inbound.await, r),
    };

    let mut failure = flatten_inbound(inbound_result).err();
    let sink = match outbound_result {
        Ok((sink, result)) => {
            if let Err(e) = result {
                failure = failure.or(Some(e));
            }
            Some(sink)
        }
        Err(e) => {
            failure = failure.or(Some(PumpError::Join(e)));
            None
        }
    };

    if let (Some(err), Some(mut sink)) = (&failure, sink) {
        error!(error = %err, "connection failed");
        close_with_error(&mut sink).await;
    }

    if let Err(e) = live_task.await {
        warn!(error = %e, "live session task failed");
    }
    info!(failed = failure.is_some(), "client disconnected");
}

fn flatten_inbound(
    r: Result<Result<(), PumpError>, tokio::task::JoinError>,
) -> Result<(), PumpError> {
    r.map_err(PumpError::Join)?
}

/// Best effort: an error frame, then close with 1011.
async fn close_with_error<S>(sink: &mut S)
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    if let Ok(json) = serde_json::to_string(&OutboundFrame::error(INTERNAL_ERROR)) {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    let close = Message::Close(Some(CloseFrame {
        code: close_code::ERROR,
        reason: "internal error".into(),
    }));
    if let Err(e) = sink.send(close).await {
        debug!(error = %e, "close frame not delivered");
    }
}

async fn inbound_pump(
    mut ws_rx: SplitStream<WebSocket>,
    requests: mpsc::Sender<LiveRequest>,
    notices: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
) -> Result<(), PumpError> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            m = ws_rx.next() => m,
        };
        let Some(message) = message else {
            debug!("client stream ended");
            return Ok(());
        };

        match message? {
            Message::Text(text) => match decode_inbound(text.as_str()) {
                Ok(request) => requests
                    .send(request)
                    .await
                    .map_err(|_| PumpError::SessionClosed)?,
                Err(e) => {
                    warn!(error = %e, "rejected client frame");
                    notices
                        .send(OutboundFrame::error(e.to_string()))
                        .await
                        .map_err(|_| PumpError::SessionClosed)?;
                }
            },
            Message::Binary(_) => {
                warn!("binary frame from client");
                notices
                    .send(OutboundFrame::error("Binary frames are not supported"))
                    .await
                    .map_err(|_| PumpError::SessionClosed)?;
            }
            Message::Close(_) => {
                let _ = requests.send(LiveRequest::Close).await;
                return Ok(());
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn outbound_pump(
    mut ws_tx: Sink,
    events: mpsc::Receiver<LiveEvent>,
    notices: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) -> (Sink, Result<(), PumpError>) {
    let result = pump_out(&mut ws_tx, events, notices, cancel).await;
    (ws_tx, result)
}

async fn pump_out(
    ws_tx: &mut Sink,
    mut events: mpsc::Receiver<LiveEvent>,
    mut notices: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) -> Result<(), PumpError> {
    let mut notices_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            notice = notices.recv(), if notices_open => match notice {
                Some(frame) => write(ws_tx, &frame).await?,
                None => notices_open = false,
            },
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("live session finished");
                    return Ok(());
                };
                for frame in encode_event(&event) {
                    write(ws_tx, &frame).await?;
                }
            }
        }
    }
}

async fn write(ws_tx: &mut Sink, frame: &OutboundFrame) -> Result<(), PumpError> {
    let json = serde_json::to_string(frame)?;
    ws_tx.send(Message::Text(json.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as sink_channel;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn failed_connection_gets_error_frame_then_1011() {
        let (mut tx, mut rx) = sink_channel::channel::<Message>(4);
        close_with_error(&mut tx).await;
        drop(tx);

        let Some(Message::Text(text)) = rx.next().await else {
            panic!("expected an error frame first");
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(frame, json!({"error": INTERNAL_ERROR, "role": "system"}));

        let Some(Message::Close(Some(close))) = rx.next().await else {
            panic!("expected a close frame");
        };
        assert_eq!(close.code, 1011);
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn closed_sink_is_not_an_error() {
        let (mut tx, rx) = sink_channel::channel::<Message>(4);
        drop(rx);
        close_with_error(&mut tx).await;
    }
}
