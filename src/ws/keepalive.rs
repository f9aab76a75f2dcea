//! PING/PONG keepalive for one connection.
//!
//! ```text
//! Idle ──open──▶ PingScheduled ──interval──▶ AwaitingPong ──pong──▶ Idle ──▶ PingScheduled …
//!                                                 │
//!                                                 └──deadline──▶ Closed (connection torn down)
//! ```

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::connection::SharedWriter;
use super::frame::OpCode;

/// Where the keepalive of a connection currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveState {
    Idle,
    /// Waiting out the interval before the next PING
    PingScheduled,
    /// A PING is out and the PONG deadline is running
    AwaitingPong,
    /// Cancelled with its connection, or the deadline passed
    Closed,
}

/// How the keepalive task reports that the connection is dead.
#[derive(Debug, Clone)]
pub(crate) struct Signals {
    /// Cancelled when the PONG deadline passes
    pub(crate) expired: CancellationToken,
    /// Cancelled when a PING could not be written
    pub(crate) write_failed: CancellationToken,
}

/// Handle to the keepalive task of one connection. Dropping it stops the task.
#[derive(Debug)]
pub(crate) struct Keepalive {
    token: CancellationToken,
    pong_tx: watch::Sender<Instant>,
    state_rx: watch::Receiver<KeepaliveState>,
}

impl Keepalive {
    /// Starts the keepalive schedule for a freshly opened connection.
    pub(crate) fn spawn(
        writer: SharedWriter,
        interval: Duration,
        deadline: Duration,
        token: CancellationToken,
        signals: Signals,
    ) -> Self {
        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        let (state_tx, state_rx) = watch::channel(KeepaliveState::Idle);

        let task_token = token.clone();
        tokio::spawn(async move {
            run(writer, interval, deadline, task_token, signals, pong_rx, &state_tx).await;
            state_tx.send_replace(KeepaliveState::Closed);
        });

        Self {
            token,
            pong_tx,
            state_rx,
        }
    }

    /// A PONG frame was read off the connection.
    pub(crate) fn pong_received(&self) {
        let solicited = *self.state_rx.borrow() == KeepaliveState::AwaitingPong;
        #[cfg(feature = "tracing")]
        if !solicited {
            tracing::trace!("PONG received without an outstanding PING");
        }
        #[cfg(not(feature = "tracing"))]
        let _ = solicited;

        self.pong_tx.send_replace(Instant::now());
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> KeepaliveState {
        *self.state_rx.borrow()
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(
    writer: SharedWriter,
    interval: Duration,
    deadline: Duration,
    token: CancellationToken,
    signals: Signals,
    mut pong_rx: watch::Receiver<Instant>,
    state_tx: &watch::Sender<KeepaliveState>,
) {
    loop {
        state_tx.send_replace(KeepaliveState::PingScheduled);
        tokio::select! {
            () = token.cancelled() => break,
            () = sleep(interval) => {}
        }

        // Mark current PONG state as seen before sending PING so a stale PONG cannot satisfy
        // the new deadline.
        drop(pong_rx.borrow_and_update());

        // The deadline starts before the PING is queued: a stalled writer counts against it
        let round_trip = timeout(deadline, ping_and_wait(&writer, &mut pong_rx, state_tx));
        let outcome = tokio::select! {
            () = token.cancelled() => break,
            outcome = round_trip => outcome,
        };

        match outcome {
            Ok(Ok(true)) => {
                #[cfg(feature = "tracing")]
                tracing::trace!("PONG received");
                state_tx.send_replace(KeepaliveState::Idle);
            }
            // Handle dropped, the connection is terminating
            Ok(Ok(false)) => break,
            Ok(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Unable to send PING");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                signals.write_failed.cancel();
                break;
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Heartbeat timeout: no PONG received within {deadline:?}");
                signals.expired.cancel();
                break;
            }
        }
    }
}

/// Sends one PING and waits for the next PONG. `Ok(false)` means the handle was dropped.
async fn ping_and_wait(
    writer: &SharedWriter,
    pong_rx: &mut watch::Receiver<Instant>,
    state_tx: &watch::Sender<KeepaliveState>,
) -> crate::Result<bool> {
    writer.send_control(OpCode::Ping, &[]).await?;
    state_tx.send_replace(KeepaliveState::AwaitingPong);

    #[cfg(feature = "tracing")]
    tracing::trace!("PING sent");

    Ok(pong_rx.changed().await.is_ok())
}
