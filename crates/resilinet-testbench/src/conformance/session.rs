//! Capture sessions and event sources
//!
//! A [`CaptureSession`] is the consumer end of the bounded channel a packet
//! I/O capture feeds. Reads are bounded by a deadline and unblock as soon as
//! the session is cancelled or the capture closes the channel.

use super::events::ProtocolEvent;
use crate::capture::{CaptureFilter, CaptureHandle};
use crate::pcap::RawPacket;
use async_trait::async_trait;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationError {
    #[error("Observation window expired")]
    Timeout,

    #[error("Capture closed")]
    Closed,
}

/// Anything that yields protocol events in capture order
#[async_trait]
pub trait EventSource: Send {
    /// Next event, waiting no later than `deadline`
    async fn next_event(&mut self, deadline: Instant) -> Result<ProtocolEvent, ObservationError>;
}

/// Cancels a session from another task
#[derive(Clone, Debug)]
pub struct SessionCanceller {
    tx: watch::Sender<bool>,
}

impl SessionCanceller {
    pub fn cancel(&self) {
        // send_replace never fails, even with no receiver left
        self.tx.send_replace(true);
    }
}

/// Live capture bound to one (endpoint, interface)
pub struct CaptureSession {
    handle: Option<CaptureHandle>,
    endpoint: String,
    iface: String,
    filter: CaptureFilter,
    receiver: mpsc::Receiver<RawPacket>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    exhausted: bool,
    packets_seen: usize,
}

impl CaptureSession {
    pub fn new(
        handle: CaptureHandle,
        filter: CaptureFilter,
        receiver: mpsc::Receiver<RawPacket>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            endpoint: handle.endpoint.clone(),
            iface: handle.iface.clone(),
            handle: Some(handle),
            filter,
            receiver,
            cancel_tx,
            cancel_rx,
            exhausted: false,
            packets_seen: 0,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn filter(&self) -> &CaptureFilter {
        &self.filter
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn packets_seen(&self) -> usize {
        self.packets_seen
    }

    pub fn canceller(&self) -> SessionCanceller {
        SessionCanceller {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Detach the capture handle so it can be released; `None` once closed
    pub(crate) fn take_handle(&mut self) -> Option<CaptureHandle> {
        let handle = self.handle.take();
        if handle.is_some() {
            self.exhausted = true;
            self.receiver.close();
            self.cancel_tx.send_replace(true);
        }
        handle
    }

    /// Next raw record
    pub async fn next_packet(&mut self, deadline: Instant) -> Result<RawPacket, ObservationError> {
        if self.exhausted {
            return Err(ObservationError::Closed);
        }
        if *self.cancel_rx.borrow() {
            // Records captured before the cancel still count
            return match self.receiver.try_recv() {
                Ok(packet) => {
                    self.packets_seen += 1;
                    Ok(packet)
                }
                Err(_) => Err(ObservationError::Closed),
            };
        }

        tokio::select! {
            biased;

            packet = self.receiver.recv() => match packet {
                Some(packet) => {
                    self.packets_seen += 1;
                    Ok(packet)
                }
                None => {
                    debug!("Capture on {}:{} ended", self.endpoint, self.iface);
                    self.exhausted = true;
                    Err(ObservationError::Closed)
                }
            },
            _ = wait_cancelled(&mut self.cancel_rx) => Err(ObservationError::Closed),
            _ = tokio::time::sleep_until(deadline) => Err(ObservationError::Timeout),
        }
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    // The session owns a sender, so the channel itself never closes
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl EventSource for CaptureSession {
    async fn next_event(&mut self, deadline: Instant) -> Result<ProtocolEvent, ObservationError> {
        loop {
            let packet = self.next_packet(deadline).await?;
            if let Some(event) = ProtocolEvent::decode(&packet, &self.filter) {
                return Ok(event);
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            warn!(
                "Capture {} on {}:{} dropped without close",
                handle.id, self.endpoint, self.iface
            );
        }
    }
}

/// Replays previously recorded events
#[derive(Clone, Debug, Default)]
pub struct ReplaySource {
    events: VecDeque<ProtocolEvent>,
}

impl ReplaySource {
    pub fn new(events: impl IntoIterator<Item = ProtocolEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }
}

#[async_trait]
impl EventSource for ReplaySource {
    async fn next_event(&mut self, _deadline: Instant) -> Result<ProtocolEvent, ObservationError> {
        self.events.pop_front().ok_or(ObservationError::Closed)
    }
}
