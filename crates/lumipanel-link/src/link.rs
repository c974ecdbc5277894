//! The display link: state, the command channel, synchronous queries
//! and the reader/dispatcher tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::command;
use crate::event::{classify, LinkEvent, LinkEventKind};
use crate::frame::{Frame, FrameReader, SerialEvent};
use crate::transport::LinkTransport;
use crate::update::ProtocolVariant;
use crate::{Error, Result, FRAME_TERMINATOR};

/// How long the display supply stays off during a power cycle.
const POWER_CYCLE_DELAY: Duration = Duration::from_millis(250);
/// Wait for the GUI firmware flag after power-up.
const PROTOCOL_FLAG_WAIT: Duration = Duration::from_millis(2500);
/// Wait for the connect acknowledgement.
const CONNECT_WAIT: Duration = Duration::from_millis(500);
/// Settle time after the garbage reset string.
const RESET_SETTLE: Duration = Duration::from_millis(250);

/// Capacity of the event fan-out channel.
const EVENT_CHANNEL_CAP: usize = 32;
/// Capacity of the reader-to-dispatcher frame channel.
const FRAME_CHANNEL_CAP: usize = 16;

/// Link mode gating ordinary command writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Bring-up in progress; ordinary commands are refused.
    Initializing,
    /// Normal operation.
    Running,
    /// A firmware/GUI transfer owns the wire. Ordinary commands are
    /// refused; leaving this state takes a device restart.
    Updating,
}

struct PendingInteger {
    token: u64,
    reply: oneshot::Sender<i32>,
}

struct PendingEvent {
    token: u64,
    kind: LinkEventKind,
    notify: oneshot::Sender<()>,
}

/// One display link: owns the transport, the link state and the
/// rendezvous slots for synchronous queries.
///
/// Lock order is always state before the write lock, never the
/// reverse; the update engine changes state while writers only read it.
pub struct DisplayLink<T> {
    io: tokio::sync::Mutex<T>,
    state: RwLock<LinkState>,
    events: broadcast::Sender<LinkEvent>,
    pending_integer: Mutex<Option<PendingInteger>>,
    pending_event: Mutex<Option<PendingEvent>>,
    query_tokens: AtomicU64,
}

impl<T: LinkTransport + Send + 'static> DisplayLink<T> {
    /// Creates a link over the given transport, in `Initializing`.
    pub fn new(transport: T) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Arc::new(Self {
            io: tokio::sync::Mutex::new(transport),
            state: RwLock::new(LinkState::Initializing),
            events,
            pending_integer: Mutex::new(None),
            pending_event: Mutex::new(None),
            query_tokens: AtomicU64::new(0),
        })
    }

    /// Spawns the reader and dispatcher tasks over a serial event feed.
    ///
    /// The reader owns frame reconstruction; dispatch runs on its own
    /// task so a slow subscriber can never stall the reader.
    pub fn start(self: &Arc<Self>, serial_rx: mpsc::Receiver<SerialEvent>) {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAP);
        tokio::spawn(read_loop(self.clone(), serial_rx, frame_tx));
        tokio::spawn(dispatch_loop(self.clone(), frame_rx));
    }

    /// Subscribes to the link event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.read().unwrap()
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        *self.state.write().unwrap() = state;
        debug!("link state -> {:?}", state);
    }

    /// Hands one classified event to waiting queries, then fans it out.
    pub(crate) fn deliver(&self, event: LinkEvent) {
        if let LinkEvent::IntegerValue(value) = event {
            if let Some(pending) = self.pending_integer.lock().unwrap().take() {
                let _ = pending.reply.send(value);
            }
        }

        {
            let mut slot = self.pending_event.lock().unwrap();
            if slot.as_ref().is_some_and(|p| p.kind == event.kind()) {
                let pending = slot.take().unwrap();
                let _ = pending.notify.send(());
            }
        }

        // Send only fails when nobody is subscribed; that is fine.
        let _ = self.events.send(event);
    }

    /// Writes one command followed by the frame terminator.
    ///
    /// Refused with `NotReady` unless the link is `Running`; no bytes
    /// touch the wire in that case.
    pub async fn write_command(&self, body: &str) -> Result<()> {
        if self.state() != LinkState::Running {
            return Err(Error::NotReady);
        }
        self.write_raw_command(body.as_bytes()).await
    }

    /// Writes a command without the Running gate. Used during bring-up,
    /// before the link reaches `Running`.
    async fn write_raw_command(&self, body: &[u8]) -> Result<()> {
        let mut io = self.io.lock().await;
        let expected = body.len() + FRAME_TERMINATOR.len();
        let mut written = io.write(body).await?;
        written += io.write(&FRAME_TERMINATOR).await?;
        if written != expected {
            return Err(Error::TransportFailure { expected, written });
        }
        Ok(())
    }

    /// Writes one raw payload chunk during a transfer. Bypasses the
    /// Running gate but still serializes on the write lock.
    pub async fn write_update_chunk(&self, data: &[u8]) -> Result<()> {
        let mut io = self.io.lock().await;
        let written = io.write(data).await?;
        io.flush().await?;
        if written != data.len() {
            return Err(Error::TransportFailure {
                expected: data.len(),
                written,
            });
        }
        Ok(())
    }

    /// Power-cycles the display.
    pub async fn restart_display(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        io.set_power(false)?;
        tokio::time::sleep(POWER_CYCLE_DELAY).await;
        io.set_power(true)?;
        Ok(())
    }

    /// Runs the bring-up sequence and moves the link to `Running`.
    ///
    /// A missing GUI flag or connect acknowledgement is logged and
    /// tolerated; the panel may be running a stock GUI.
    pub async fn bring_up(&self) -> Result<()> {
        self.restart_display().await?;

        match self
            .wait_for_event(LinkEventKind::ProtocolFlagSeen, PROTOCOL_FLAG_WAIT)
            .await
        {
            Ok(()) => info!("display is running the lumipanel GUI"),
            Err(Error::Timeout) => {
                warn!("no GUI flag after power-up; is the panel running the lumipanel GUI?")
            }
            Err(e) => return Err(e),
        }

        // Garbage string knocks the panel out of any half-entered command.
        self.write_raw_command(b"DRAKJHSUYDGBNCJHGJKSHBDN").await?;
        tokio::time::sleep(RESET_SETTLE).await;

        self.write_raw_command(b"connect").await?;
        match self
            .wait_for_event(LinkEventKind::ConnectedAck, CONNECT_WAIT)
            .await
        {
            Ok(()) => info!("connected to display"),
            Err(Error::Timeout) => warn!("no connect acknowledgement, continuing anyway"),
            Err(e) => return Err(e),
        }

        // Quiet command acks and disable auto-sleep. Sent twice; the
        // panel occasionally drops the first write after power-up.
        for _ in 0..2 {
            self.write_raw_command(b"bkcmd=0").await?;
            self.write_raw_command(b"sleep=0").await?;
        }

        self.set_state(LinkState::Running);
        info!("display link running");
        Ok(())
    }

    /// Reads a component's integer value synchronously.
    ///
    /// At most one integer query may be outstanding; a second call
    /// fails fast with `Busy` and writes nothing to the wire.
    pub async fn get_component_value(&self, component: &str, wait: Duration) -> Result<i32> {
        let token = self.query_tokens.fetch_add(1, Ordering::Relaxed);
        let reply_rx = {
            let mut slot = self.pending_integer.lock().unwrap();
            if slot.is_some() {
                return Err(Error::Busy);
            }
            let (reply, reply_rx) = oneshot::channel();
            *slot = Some(PendingInteger { token, reply });
            reply_rx
        };

        if let Err(e) = self.write_command(&command::get_value(component)).await {
            self.clear_pending_integer(token);
            return Err(e);
        }

        match timeout(wait, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(_) => {
                self.clear_pending_integer(token);
                Err(Error::Timeout)
            }
        }
    }

    /// Blocks until the dispatcher delivers an event of `kind`.
    ///
    /// No replay: an event that fired before registration does not
    /// satisfy the wait.
    pub async fn wait_for_event(&self, kind: LinkEventKind, wait: Duration) -> Result<()> {
        let token = self.query_tokens.fetch_add(1, Ordering::Relaxed);
        let notify_rx = {
            let mut slot = self.pending_event.lock().unwrap();
            if slot.is_some() {
                return Err(Error::Busy);
            }
            let (notify, notify_rx) = oneshot::channel();
            *slot = Some(PendingEvent {
                token,
                kind,
                notify,
            });
            notify_rx
        };

        match timeout(wait, notify_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                self.clear_pending_event(token);
                Err(Error::Timeout)
            }
        }
    }

    fn clear_pending_integer(&self, token: u64) {
        let mut slot = self.pending_integer.lock().unwrap();
        if slot.as_ref().is_some_and(|p| p.token == token) {
            *slot = None;
        }
    }

    fn clear_pending_event(&self, token: u64) {
        let mut slot = self.pending_event.lock().unwrap();
        if slot.as_ref().is_some_and(|p| p.token == token) {
            *slot = None;
        }
    }

    /// Puts the link into `Updating` and opens the transfer: power
    /// cycle, begin-upload command, then the baud switch.
    pub(crate) async fn enter_update_mode(
        &self,
        total_size: u64,
        baud_rate: u32,
        variant: ProtocolVariant,
        panel_boot_delay: Duration,
    ) -> Result<()> {
        // State first, then the write lock (lock order invariant).
        self.set_state(LinkState::Updating);
        let mut io = self.io.lock().await;

        io.set_power(false)?;
        tokio::time::sleep(POWER_CYCLE_DELAY).await;
        io.set_power(true)?;
        tokio::time::sleep(panel_boot_delay).await;

        let begin = command::begin_upload(total_size, baud_rate, variant);
        info!("opening display upload: {}", begin);
        let expected = begin.len() + FRAME_TERMINATOR.len();
        let mut written = io.write(begin.as_bytes()).await?;
        written += io.write(&FRAME_TERMINATOR).await?;
        io.flush().await?;
        if written != expected {
            return Err(Error::TransportFailure { expected, written });
        }

        io.set_baud_rate(baud_rate)?;
        Ok(())
    }

    // Typed command helpers. All gate on `Running` via `write_command`.

    pub async fn go_to_page(&self, page: &str) -> Result<()> {
        self.write_command(&command::go_to_page(page)).await
    }

    pub async fn set_component_text(&self, component: &str, text: &str) -> Result<()> {
        self.write_command(&command::set_text(component, text)).await
    }

    pub async fn set_component_value(&self, component: &str, value: i32) -> Result<()> {
        self.write_command(&command::set_value(component, value))
            .await
    }

    pub async fn set_component_visibility(&self, component: &str, visible: bool) -> Result<()> {
        self.write_command(&command::set_visibility(component, visible))
            .await
    }

    pub async fn set_component_foreground(&self, component: &str, color: u16) -> Result<()> {
        self.write_command(&command::set_foreground(component, color))
            .await
    }

    pub async fn set_component_pic(&self, component: &str, pic: u8) -> Result<()> {
        self.write_command(&command::set_pic(component, pic)).await
    }

    pub async fn set_timer_value(&self, component: &str, interval_ms: u16) -> Result<()> {
        self.write_command(&command::set_timer(component, interval_ms))
            .await
    }

    pub async fn set_brightness(&self, percent: u8) -> Result<()> {
        self.write_command(&command::set_brightness(percent)).await
    }
}

/// Consumes serial events and reconstructs frames. The framing mode
/// follows the link state: raw chunks while `Updating`, terminated
/// frames otherwise.
async fn read_loop<T: LinkTransport + Send + 'static>(
    link: Arc<DisplayLink<T>>,
    mut serial_rx: mpsc::Receiver<SerialEvent>,
    frame_tx: mpsc::Sender<Frame>,
) {
    let mut reader = FrameReader::new();
    while let Some(event) = serial_rx.recv().await {
        match event {
            SerialEvent::Data(chunk) => {
                if link.state() == LinkState::Updating {
                    if let Some(frame) = reader.push_raw(&chunk) {
                        if frame_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                } else {
                    for frame in reader.push_terminated(&chunk) {
                        if frame_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
            SerialEvent::Overflow => reader.reset(),
        }
    }
    debug!("serial event feed closed, reader task exiting");
}

/// Classifies frames in wire order and delivers the resulting events.
async fn dispatch_loop<T: LinkTransport + Send + 'static>(
    link: Arc<DisplayLink<T>>,
    mut frame_rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Some(event) = classify(frame.bytes()) {
            link.deliver(event);
        }
    }
    debug!("frame feed closed, dispatcher task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::time::Instant;

    fn running_link(transport: MockTransport) -> Arc<DisplayLink<MockTransport>> {
        let link = DisplayLink::new(transport);
        link.set_state(LinkState::Running);
        link
    }

    #[tokio::test]
    async fn write_command_appends_terminator() {
        let transport = MockTransport::new();
        let writes = transport.writes.clone();
        let link = running_link(transport);

        link.write_command("page home").await.unwrap();

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"page home");
        assert_eq!(writes[1], FRAME_TERMINATOR.to_vec());
    }

    #[tokio::test]
    async fn write_command_refused_unless_running() {
        let transport = MockTransport::new();
        let writes = transport.writes.clone();
        let link = DisplayLink::new(transport);

        assert!(matches!(
            link.write_command("page home").await,
            Err(Error::NotReady)
        ));

        link.set_state(LinkState::Updating);
        assert!(matches!(
            link.set_brightness(50).await,
            Err(Error::NotReady)
        ));

        // No bytes reached the wire in either state.
        assert!(writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_chunk_write_bypasses_running_gate() {
        let transport = MockTransport::new();
        let writes = transport.writes.clone();
        let link = DisplayLink::new(transport);
        link.set_state(LinkState::Updating);

        link.write_update_chunk(&[0xAA; 16]).await.unwrap();
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn integer_query_rendezvous() {
        let transport = MockTransport::new();
        let writes = transport.writes.clone();
        let link = running_link(transport);

        let query_link = link.clone();
        let query = tokio::spawn(async move {
            query_link
                .get_component_value("s_bright", Duration::from_secs(1))
                .await
        });

        // Wait for the query command to hit the wire before replying.
        while writes.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(writes.lock().unwrap()[0], b"get s_bright.val");

        link.deliver(LinkEvent::IntegerValue(42));
        assert_eq!(query.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn second_integer_query_is_busy_without_wire_write() {
        let transport = MockTransport::new();
        let writes = transport.writes.clone();
        let link = running_link(transport);

        let first_link = link.clone();
        let first = tokio::spawn(async move {
            first_link
                .get_component_value("a", Duration::from_millis(500))
                .await
        });

        while writes.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let writes_before = writes.lock().unwrap().len();

        assert!(matches!(
            link.get_component_value("b", Duration::from_millis(500)).await,
            Err(Error::Busy)
        ));
        assert_eq!(writes.lock().unwrap().len(), writes_before);

        link.deliver(LinkEvent::IntegerValue(7));
        assert_eq!(first.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn integer_query_times_out_and_slot_clears() {
        let link = running_link(MockTransport::new());

        let wait = Duration::from_millis(50);
        let started = Instant::now();
        let result = link.get_component_value("s_bright", wait).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(started.elapsed() >= wait);

        // The slot was cleared; a fresh query works normally.
        let query_link = link.clone();
        let query = tokio::spawn(async move {
            query_link
                .get_component_value("s_bright", Duration::from_secs(1))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        link.deliver(LinkEvent::IntegerValue(3));
        assert_eq!(query.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn wait_for_event_rendezvous_and_timeout() {
        let link = running_link(MockTransport::new());

        let wait_link = link.clone();
        let waiter = tokio::spawn(async move {
            wait_link
                .wait_for_event(LinkEventKind::ConnectedAck, Duration::from_secs(1))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // An event of a different kind must not satisfy the wait.
        link.deliver(LinkEvent::SleepRequested);
        link.deliver(LinkEvent::ConnectedAck);
        waiter.await.unwrap().unwrap();

        // No replay: the ack above is gone, a new wait times out.
        let result = link
            .wait_for_event(LinkEventKind::ConnectedAck, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let link = running_link(MockTransport::new());
        let mut first = link.subscribe();
        let mut second = link.subscribe();

        link.deliver(LinkEvent::TouchEvent {
            page: 2,
            component: 22,
            pressed: true,
        });

        let expected = LinkEvent::TouchEvent {
            page: 2,
            component: 22,
            pressed: true,
        };
        assert_eq!(first.recv().await.unwrap(), expected);
        assert_eq!(second.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn reader_and_dispatcher_deliver_wire_frames() {
        let link = running_link(MockTransport::new());
        let (serial_tx, serial_rx) = mpsc::channel(16);
        link.start(serial_rx);
        let mut events = link.subscribe();

        serial_tx
            .send(SerialEvent::Data(b"\x71\x0A\x00\x00\x00\xFF\xFF\xFF".to_vec()))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::IntegerValue(10));

        serial_tx
            .send(SerialEvent::Data(b"\x65\x02\x16\x01\xFF\xFF\xFF".to_vec()))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::TouchEvent {
                page: 2,
                component: 22,
                pressed: true
            }
        );
    }

    #[tokio::test]
    async fn reader_uses_raw_framing_while_updating() {
        let link = running_link(MockTransport::new());
        let (serial_tx, serial_rx) = mpsc::channel(16);
        link.start(serial_rx);
        let mut events = link.subscribe();
        link.set_state(LinkState::Updating);

        // Ready signal arrives unterminated during a transfer.
        serial_tx
            .send(SerialEvent::Data(vec![0x05]))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::UpdateReadyForNextChunk
        );

        // Split jump instruction across two chunk deliveries.
        serial_tx.send(SerialEvent::Data(vec![0x08])).await.unwrap();
        serial_tx
            .send(SerialEvent::Data(vec![0x88, 0x13, 0x00, 0x00]))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::UpdateJumpToOffset(5000)
        );
    }
}
