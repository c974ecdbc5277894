//! Frame classification into typed link events.

use tracing::warn;

/// Header byte of a numeric value response.
pub const NUMERIC_HEAD: u8 = 0x71;
/// Header byte of a touch press/release report.
pub const TOUCH_HEAD: u8 = 0x65;
/// Single-byte sleep notification.
pub const SLEEP_HEAD: u8 = 0x86;
/// Single-byte wake notification.
pub const WAKE_HEAD: u8 = 0x87;
/// Ready-for-next-chunk signal during a transfer.
pub const READY_HEAD: u8 = 0x05;
/// Jump-to-offset instruction during a transfer.
pub const JUMP_HEAD: u8 = 0x08;

/// Flag emitted by our GUI firmware shortly after panel power-up.
/// Matched against the frame tail since the panel may prepend garbage.
pub const PROTOCOL_FLAG: &[u8] = b"LMPN";
/// Connect acknowledgement prefix from the display controller.
pub const CONNECT_ACK: &[u8] = b"comok";

/// The classified result of interpreting one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Display answered the `connect` command.
    ConnectedAck,
    /// Our GUI firmware announced itself after power-up.
    ProtocolFlagSeen,
    /// Numeric response to a `get` query.
    IntegerValue(i32),
    /// Touch press or release on a component.
    TouchEvent { page: u8, component: u8, pressed: bool },
    /// Display is entering sleep.
    SleepRequested,
    /// Display woke from sleep.
    WakeRequested,
    /// Display accepted the last transfer chunk and wants the next.
    UpdateReadyForNextChunk,
    /// Display wants the transfer to continue at the given offset.
    UpdateJumpToOffset(u32),
    /// Anything the rules above did not claim.
    Unknown(Vec<u8>),
}

impl LinkEvent {
    pub fn kind(&self) -> LinkEventKind {
        match self {
            LinkEvent::ConnectedAck => LinkEventKind::ConnectedAck,
            LinkEvent::ProtocolFlagSeen => LinkEventKind::ProtocolFlagSeen,
            LinkEvent::IntegerValue(_) => LinkEventKind::IntegerValue,
            LinkEvent::TouchEvent { .. } => LinkEventKind::TouchEvent,
            LinkEvent::SleepRequested => LinkEventKind::SleepRequested,
            LinkEvent::WakeRequested => LinkEventKind::WakeRequested,
            LinkEvent::UpdateReadyForNextChunk => LinkEventKind::UpdateReadyForNextChunk,
            LinkEvent::UpdateJumpToOffset(_) => LinkEventKind::UpdateJumpToOffset,
            LinkEvent::Unknown(_) => LinkEventKind::Unknown,
        }
    }
}

/// Payload-free discriminant, used when waiting for a particular event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventKind {
    ConnectedAck,
    ProtocolFlagSeen,
    IntegerValue,
    TouchEvent,
    SleepRequested,
    WakeRequested,
    UpdateReadyForNextChunk,
    UpdateJumpToOffset,
    Unknown,
}

/// Classifies one frame. First matching rule wins.
///
/// Returns `None` for frames that match a rule's header but are too
/// short for its payload; those are logged and dropped rather than
/// surfaced as errors.
pub fn classify(frame: &[u8]) -> Option<LinkEvent> {
    let first = *frame.first()?;

    if first == NUMERIC_HEAD {
        if frame.len() < 5 {
            warn!("numeric response too short ({} bytes), dropping", frame.len());
            return None;
        }
        let value = i32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
        return Some(LinkEvent::IntegerValue(value));
    }

    if first == TOUCH_HEAD {
        if frame.len() < 4 {
            warn!("touch report too short ({} bytes), dropping", frame.len());
            return None;
        }
        return Some(LinkEvent::TouchEvent {
            page: frame[1],
            component: frame[2],
            pressed: frame[3] != 0,
        });
    }

    if first == SLEEP_HEAD {
        return Some(LinkEvent::SleepRequested);
    }

    if first == WAKE_HEAD {
        return Some(LinkEvent::WakeRequested);
    }

    if frame.len() >= PROTOCOL_FLAG.len() && frame.ends_with(PROTOCOL_FLAG) {
        return Some(LinkEvent::ProtocolFlagSeen);
    }

    if frame.len() >= CONNECT_ACK.len() && frame.starts_with(CONNECT_ACK) {
        return Some(LinkEvent::ConnectedAck);
    }

    if first == READY_HEAD {
        return Some(LinkEvent::UpdateReadyForNextChunk);
    }

    if first == JUMP_HEAD {
        if frame.len() < 5 {
            warn!("jump instruction too short ({} bytes), dropping", frame.len());
            return None;
        }
        let offset = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
        return Some(LinkEvent::UpdateJumpToOffset(offset));
    }

    Some(LinkEvent::Unknown(frame.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_value_is_little_endian() {
        assert_eq!(
            classify(&[0x71, 10, 0, 0, 0]),
            Some(LinkEvent::IntegerValue(10))
        );
        assert_eq!(
            classify(&[0x71, 0xFF, 0xFF, 0xFF, 0xFF]),
            Some(LinkEvent::IntegerValue(-1))
        );
    }

    #[test]
    fn touch_event_fields() {
        assert_eq!(
            classify(&[0x65, 2, 22, 1]),
            Some(LinkEvent::TouchEvent {
                page: 2,
                component: 22,
                pressed: true
            })
        );
        assert_eq!(
            classify(&[0x65, 0, 5, 0]),
            Some(LinkEvent::TouchEvent {
                page: 0,
                component: 5,
                pressed: false
            })
        );
    }

    #[test]
    fn sleep_and_wake_markers() {
        assert_eq!(classify(&[0x86]), Some(LinkEvent::SleepRequested));
        assert_eq!(classify(&[0x87]), Some(LinkEvent::WakeRequested));
    }

    #[test]
    fn protocol_flag_matches_frame_tail() {
        assert_eq!(classify(b"LMPN"), Some(LinkEvent::ProtocolFlagSeen));
        // Garbage before the flag is tolerated.
        assert_eq!(classify(b"\x00\x1ALMPN"), Some(LinkEvent::ProtocolFlagSeen));
    }

    #[test]
    fn connect_ack_matches_frame_head() {
        assert_eq!(
            classify(b"comok 1,30,NX4832T035,52"),
            Some(LinkEvent::ConnectedAck)
        );
    }

    #[test]
    fn transfer_signals() {
        assert_eq!(classify(&[0x05]), Some(LinkEvent::UpdateReadyForNextChunk));
        assert_eq!(
            classify(&[0x08, 0x88, 0x13, 0x00, 0x00]),
            Some(LinkEvent::UpdateJumpToOffset(5000))
        );
    }

    #[test]
    fn undersized_frames_are_dropped() {
        assert_eq!(classify(&[0x71, 1, 2]), None);
        assert_eq!(classify(&[0x65, 1]), None);
        assert_eq!(classify(&[0x08, 1, 2, 3]), None);
        assert_eq!(classify(&[]), None);
    }

    #[test]
    fn unmatched_frames_become_unknown() {
        assert_eq!(
            classify(&[0x70, 0x41]),
            Some(LinkEvent::Unknown(vec![0x70, 0x41]))
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let frame = [0x65, 3, 7, 1];
        assert_eq!(classify(&frame), classify(&frame));
    }
}
