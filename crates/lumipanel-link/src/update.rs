//! Firmware/GUI transfer engine.
//!
//! The transfer is device-paced: the engine never pushes a chunk until
//! the display has asked for one, either with a ready signal or a
//! jump-to-offset instruction.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::event::LinkEvent;
use crate::link::{DisplayLink, LinkState};
use crate::transport::LinkTransport;
use crate::{Error, Result, MAX_UPDATE_CHUNK};

/// Capacity of the status fan-out channel.
const STATUS_CHANNEL_CAP: usize = 16;
/// Attempts at sizing the payload before the transfer is abandoned.
const SIZE_PROBE_ATTEMPTS: u32 = 3;

/// Where the transfer payload comes from.
#[allow(async_fn_in_trait)]
pub trait PayloadSource: Send {
    /// Total payload size in bytes.
    async fn total_size(&mut self) -> Result<u64>;

    /// Fetches exactly `length` bytes starting at `offset`.
    async fn fetch(&mut self, offset: u64, length: u32) -> Result<Vec<u8>>;
}

/// Which begin-upload command dialect the display firmware speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// Legacy `whmi-wri` dialect.
    V1,
    /// `whmi-wris` dialect with resume support.
    #[default]
    V2,
}

impl FromStr for ProtocolVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v1" | "legacy" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            other => Err(format!("unknown upload protocol variant '{other}'")),
        }
    }
}

/// Progress reports emitted while a transfer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Started { total_size: u64 },
    /// `offset` counts bytes the display has been sent so far.
    Progress { offset: u64, total_size: u64 },
    Finished,
    Failed,
}

/// Book-keeping for one transfer, returned when it completes.
#[derive(Debug, Clone, Copy)]
pub struct UpdateSession {
    pub total_size: u64,
    pub current_offset: u64,
    pub last_chunk_len: u32,
    pub baud_rate: u32,
    pub protocol_variant: ProtocolVariant,
}

/// Delays and timeouts of the transfer protocol. The defaults match
/// the display's observed behavior; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct UpdateTiming {
    /// Wait for the panel to boot after the pre-transfer power cycle.
    pub panel_boot_delay: Duration,
    /// How long to wait for a ready/jump signal before logging a stall.
    pub signal_timeout: Duration,
    /// Pause between retries of a failed fetch or write.
    pub retry_backoff: Duration,
    /// Grace period after the final chunk, while the display flashes
    /// itself and restarts.
    pub restart_grace: Duration,
}

impl Default for UpdateTiming {
    fn default() -> Self {
        Self {
            panel_boot_delay: Duration::from_secs(5),
            signal_timeout: Duration::from_secs(20),
            retry_backoff: Duration::from_secs(5),
            restart_grace: Duration::from_secs(10),
        }
    }
}

/// Drives one firmware/GUI transfer over an established link.
///
/// On success the link is left in `Updating`; the display has restarted
/// with new firmware and only a fresh bring-up (in practice a process
/// restart) returns the link to service.
pub struct UpdateEngine<T, P> {
    link: Arc<DisplayLink<T>>,
    payload: P,
    status: broadcast::Sender<UpdateStatus>,
    baud_rate: u32,
    variant: ProtocolVariant,
    timing: UpdateTiming,
}

impl<T: LinkTransport + Send + 'static, P: PayloadSource> UpdateEngine<T, P> {
    pub fn new(link: Arc<DisplayLink<T>>, payload: P, baud_rate: u32) -> Self {
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAP);
        Self {
            link,
            payload,
            status,
            baud_rate,
            variant: ProtocolVariant::default(),
            timing: UpdateTiming::default(),
        }
    }

    pub fn with_variant(mut self, variant: ProtocolVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_timing(mut self, timing: UpdateTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Subscribes to transfer progress reports.
    pub fn subscribe_status(&self) -> broadcast::Receiver<UpdateStatus> {
        self.status.subscribe()
    }

    /// Runs the transfer to completion.
    ///
    /// The payload is sized before the display is touched, so a dead
    /// payload source aborts without disturbing the running link.
    pub async fn run(mut self) -> Result<UpdateSession> {
        let total_size = match self.probe_total_size().await {
            Ok(size) => size,
            Err(e) => {
                error!("could not size update payload: {}", e);
                let _ = self.status.send(UpdateStatus::Failed);
                return Err(e);
            }
        };
        info!("starting display update, {} bytes", total_size);

        // Subscribe before the mode switch so no early signal is lost.
        let mut events = self.link.subscribe();
        if let Err(e) = self
            .link
            .enter_update_mode(
                total_size,
                self.baud_rate,
                self.variant,
                self.timing.panel_boot_delay,
            )
            .await
        {
            // Setup failed before any payload byte went out; hand the
            // link back to normal operation.
            error!("could not open the display transfer: {}", e);
            self.link.set_state(LinkState::Running);
            let _ = self.status.send(UpdateStatus::Failed);
            return Err(e);
        }
        let _ = self.status.send(UpdateStatus::Started { total_size });

        let mut session = UpdateSession {
            total_size,
            current_offset: 0,
            last_chunk_len: 0,
            baud_rate: self.baud_rate,
            protocol_variant: self.variant,
        };

        loop {
            let signal = match timeout(
                self.timing.signal_timeout,
                next_update_signal(&mut events),
            )
            .await
            {
                Ok(Some(signal)) => signal,
                Ok(None) => {
                    error!("link event feed closed mid-transfer");
                    let _ = self.status.send(UpdateStatus::Failed);
                    return Err(Error::Timeout);
                }
                Err(_) => {
                    warn!(
                        "no transfer signal for {:?} at offset {}, still waiting",
                        self.timing.signal_timeout, session.current_offset
                    );
                    continue;
                }
            };

            match signal {
                LinkEvent::UpdateReadyForNextChunk => {
                    session.current_offset += u64::from(session.last_chunk_len);
                }
                LinkEvent::UpdateJumpToOffset(offset) => {
                    // Offset zero means continue sequentially.
                    if offset > 0 {
                        debug!(
                            "display requested jump from {} to {}",
                            session.current_offset + u64::from(session.last_chunk_len),
                            offset
                        );
                        session.current_offset = u64::from(offset);
                    } else {
                        session.current_offset += u64::from(session.last_chunk_len);
                    }
                }
                _ => continue,
            }

            // A jump past the end leaves nothing to send.
            if session.current_offset >= total_size {
                break;
            }

            let chunk_len =
                (total_size - session.current_offset).min(u64::from(MAX_UPDATE_CHUNK)) as u32;
            let chunk = self.fetch_chunk(session.current_offset, chunk_len).await;
            self.write_chunk(&chunk).await;

            session.last_chunk_len = chunk_len;
            let sent = session.current_offset + u64::from(chunk_len);
            let _ = self.status.send(UpdateStatus::Progress {
                offset: sent,
                total_size,
            });

            // The display sends no further signal once it has the last
            // byte; the transfer is done right after that write.
            if sent >= total_size {
                session.current_offset = sent;
                break;
            }
        }

        info!("display update transferred, waiting for panel to flash");
        let _ = self.status.send(UpdateStatus::Finished);
        sleep(self.timing.restart_grace).await;
        Ok(session)
    }

    async fn probe_total_size(&mut self) -> Result<u64> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.payload.total_size().await {
                Ok(0) => return Err(Error::Payload("update payload is empty".into())),
                Ok(size) => return Ok(size),
                Err(e) if attempt < SIZE_PROBE_ATTEMPTS => {
                    warn!(
                        "payload sizing attempt {}/{} failed: {}",
                        attempt, SIZE_PROBE_ATTEMPTS, e
                    );
                    sleep(self.timing.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetches one chunk, retrying the same range until the source
    /// returns exactly the requested bytes.
    async fn fetch_chunk(&mut self, offset: u64, length: u32) -> Vec<u8> {
        loop {
            match self.payload.fetch(offset, length).await {
                Ok(chunk) if chunk.len() == length as usize => return chunk,
                Ok(chunk) => {
                    warn!(
                        "short payload read at offset {}: wanted {}, got {}; retrying",
                        offset,
                        length,
                        chunk.len()
                    );
                }
                Err(e) => {
                    warn!("payload fetch at offset {} failed: {}; retrying", offset, e);
                }
            }
            sleep(self.timing.retry_backoff).await;
        }
    }

    async fn write_chunk(&mut self, chunk: &[u8]) {
        loop {
            match self.link.write_update_chunk(chunk).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("chunk write failed: {}; retrying", e);
                    sleep(self.timing.retry_backoff).await;
                }
            }
        }
    }
}

/// Waits for the next transfer-pacing signal, skipping unrelated
/// events. Returns `None` only when the event feed is gone.
async fn next_update_signal(
    events: &mut broadcast::Receiver<LinkEvent>,
) -> Option<LinkEvent> {
    loop {
        match events.recv().await {
            Ok(
                signal @ (LinkEvent::UpdateReadyForNextChunk | LinkEvent::UpdateJumpToOffset(_)),
            ) => return Some(signal),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("event subscriber lagged, {} events missed", missed);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
