//! The two directional loops of a bridge session
//!
//! `client -> upstream` and `upstream -> client` run as two futures raced
//! against cancellation and the session deadline. Whichever ends first
//! decides the close reason. The other direction is then wound down: stdin
//! gets EOF, remaining output is drained for the grace period, the exit
//! status and a close frame go to the client, and the session is Closed.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::frames::{close_frame, ClientFrame, FrameMode, ServerFrame};
use crate::sessions::{CloseReason, Session, SessionState};
use crate::upstream::{ShellInput, ShellOutput, ShellStream};

/// Relay one connected client to one upstream process until either side ends
///
/// Returns the reason the session ended. Writes in each direction are
/// sequential, so a slow client stalls upstream reads instead of buffering
/// without bound.
pub async fn relay<S, K, E>(
    session: Arc<Session>,
    shell: ShellStream,
    mode: FrameMode,
    grace: Duration,
    mut incoming: S,
    mut outgoing: K,
) -> CloseReason
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    K: Sink<Message> + Unpin,
    E: Display,
{
    let ShellStream {
        mut input,
        mut output,
        exit,
    } = shell;

    session.advance(SessionState::Active);
    info!(session = %session.id(), target = session.target().label(), "session active");

    let cancel = session.cancellation().clone();
    let reason = {
        let to_upstream = pump_input(&session, mode, &mut incoming, input.as_mut());
        let to_client = pump_output(&session, mode, &mut output, &mut outgoing);
        tokio::select! {
            reason = to_upstream => reason,
            reason = to_client => reason,
            _ = cancel.cancelled() => session.close_reason().unwrap_or(CloseReason::AdminClosed),
            _ = expiry(session.deadline()) => CloseReason::DeadlineExceeded,
        }
    };

    session.request_close(reason.clone());
    let reason = session.close_reason().unwrap_or(reason);
    debug!(session = %session.id(), reason = %reason, "session closing");

    input.close().await;

    let client_gone = matches!(reason, CloseReason::ClientClosed);
    if !client_gone {
        let wind_down = async {
            while let Some(chunk) = output.recv().await {
                if send(&mut outgoing, mode.encode(ServerFrame::Output(chunk.stream, chunk.data)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let status = exit.await;
            let _ = send(&mut outgoing, mode.encode(ServerFrame::Exit(status))).await;
        };
        if tokio::time::timeout(grace, wind_down).await.is_err() {
            debug!(session = %session.id(), "drain grace expired");
        }
        if let CloseReason::Error(message) = &reason {
            let _ = send(&mut outgoing, mode.encode(ServerFrame::Error(message.clone()))).await;
        }
        let _ = send(&mut outgoing, close_frame(&reason)).await;
    }
    let _ = outgoing.close().await;

    session.advance(SessionState::Closed);
    reason
}

async fn pump_input<S, E>(
    session: &Session,
    mode: FrameMode,
    incoming: &mut S,
    input: &mut dyn ShellInput,
) -> CloseReason
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(message) = incoming.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => return CloseReason::Error(format!("client read failed: {}", e)),
        };
        session.touch();
        match mode.decode(message) {
            ClientFrame::Stdin(data) => {
                if let Err(e) = input.write(data).await {
                    return CloseReason::Error(format!("upstream write failed: {}", e));
                }
            }
            ClientFrame::Resize { width, height } => input.resize(width, height).await,
            ClientFrame::Close => return CloseReason::ClientClosed,
            ClientFrame::Ignore => {}
        }
    }
    CloseReason::ClientClosed
}

async fn pump_output<K>(
    session: &Session,
    mode: FrameMode,
    output: &mut mpsc::Receiver<ShellOutput>,
    outgoing: &mut K,
) -> CloseReason
where
    K: Sink<Message> + Unpin,
{
    while let Some(chunk) = output.recv().await {
        session.touch();
        if send(outgoing, mode.encode(ServerFrame::Output(chunk.stream, chunk.data)))
            .await
            .is_err()
        {
            return CloseReason::ClientClosed;
        }
    }
    CloseReason::UpstreamClosed
}

async fn send<K>(outgoing: &mut K, message: Message) -> Result<(), ()>
where
    K: Sink<Message> + Unpin,
{
    outgoing.send(message).await.map_err(|_| ())
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
