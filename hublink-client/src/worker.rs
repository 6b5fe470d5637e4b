//! The background task that drives a session once `connect` hands it over.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use hublink_core::ConnectionState;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::dispatch::dispatch;
use crate::event::DisconnectReason;
use crate::helper::Shared;
use crate::session::{Inbound, LivenessError};

/// Hand-off from `connect` to the worker.
pub(crate) struct Start {
    pub(crate) inbound: Inbound,
    /// Held until the session has fully wound down.
    pub(crate) slot: OwnedMutexGuard<()>,
}

enum PollEvent {
    Readable,
    Timeout,
    HangUp(String),
    Invalid(io::Error),
    Error(io::Error),
}

/// Serve sessions until the helper goes away.
pub(crate) async fn run(shared: Arc<Shared>, mut rx: mpsc::Receiver<Start>) {
    debug!("Connection worker started");

    while let Some(Start { mut inbound, slot }) = rx.recv().await {
        debug!("Connection worker received start signal");

        let reason = poll_loop(&shared, &mut inbound).await;
        drop(inbound);
        shared.outbound.lock().await.take();

        shared.state.set(ConnectionState::Disconnected);
        info!("Connection closed: {:?}", reason);
        shared.report_disconnect(reason);

        drop(slot);
    }

    debug!("Connection worker stopped");
}

async fn poll_loop(shared: &Shared, inbound: &mut Inbound) -> DisconnectReason {
    loop {
        match shared.state.get() {
            ConnectionState::Disconnecting => {
                debug!("Disconnect requested, leaving poll loop");
                return DisconnectReason::ClientInitiated;
            }
            ConnectionState::Disconnected | ConnectionState::Uninitialized => {
                return DisconnectReason::ClientInitiated;
            }
            _ => {}
        }

        let wait = match shared.outbound.lock().await.as_ref() {
            Some(outbound) => outbound.keepalive_time_left(),
            None => {
                error!("Transport released after a failed write");
                return terminal(
                    shared,
                    DisconnectReason::ConnectionLost("outbound write failed".into()),
                );
            }
        };

        let event = tokio::select! {
            _ = shared.wake.notified() => continue,
            event = poll_socket(inbound, wait) => event,
        };

        match event {
            PollEvent::Timeout => {
                let result = match shared.outbound.lock().await.as_mut() {
                    Some(outbound) => outbound.process_liveness().await,
                    None => continue,
                };

                match result {
                    Ok(()) | Err(LivenessError::NotYet) => continue,
                    Err(LivenessError::Unanswered) => {
                        error!("Keep-alive ping failed: previous PINGREQ unanswered");
                    }
                    Err(LivenessError::Send(e)) => {
                        error!("Keep-alive ping failed: {}", e);
                    }
                }
                return terminal(shared, DisconnectReason::KeepAliveTimeout);
            }
            PollEvent::Readable => loop {
                let packet = match inbound.next_packet() {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to decode inbound data: {}", e);
                        return terminal(shared, DisconnectReason::ProtocolError(e.to_string()));
                    }
                };

                if let Some(reason) = dispatch(shared, inbound, packet).await {
                    return reason;
                }

                if matches!(
                    shared.state.get(),
                    ConnectionState::Disconnected | ConnectionState::Uninitialized
                ) {
                    return DisconnectReason::ClientInitiated;
                }
            },
            PollEvent::HangUp(cause) => {
                if shared.state.verify(ConnectionState::Disconnecting) {
                    debug!("Socket closed after disconnect: {}", cause);
                } else {
                    error!("Socket hung up: {}", cause);
                }
                return terminal(shared, DisconnectReason::ConnectionLost(cause));
            }
            PollEvent::Invalid(e) => {
                if matches!(
                    shared.state.get(),
                    ConnectionState::Disconnecting | ConnectionState::Disconnected
                ) {
                    debug!("Socket is no longer valid: {}", e);
                } else {
                    error!("Socket is no longer valid: {}", e);
                }
                return terminal(shared, DisconnectReason::ConnectionLost(e.to_string()));
            }
            PollEvent::Error(e) => {
                error!("Socket error: {}", e);
                return terminal(shared, DisconnectReason::ConnectionLost(e.to_string()));
            }
        }
    }
}

async fn poll_socket(inbound: &mut Inbound, wait: Option<Duration>) -> PollEvent {
    let read = inbound.fill();

    let result = match wait {
        Some(wait) => match timeout(wait, read).await {
            Ok(result) => result,
            Err(_) => return PollEvent::Timeout,
        },
        None => read.await,
    };

    match result {
        Ok(0) => PollEvent::HangUp("connection closed by peer".into()),
        Ok(_) => PollEvent::Readable,
        Err(e) => classify(e),
    }
}

fn classify(e: io::Error) -> PollEvent {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => PollEvent::HangUp(e.to_string()),
        io::ErrorKind::NotConnected => PollEvent::Invalid(e),
        _ => PollEvent::Error(e),
    }
}

/// Sessions that end while `Disconnecting` count as client initiated.
fn terminal(shared: &Shared, reason: DisconnectReason) -> DisconnectReason {
    if shared.state.verify(ConnectionState::Disconnecting) {
        DisconnectReason::ClientInitiated
    } else {
        reason
    }
}
