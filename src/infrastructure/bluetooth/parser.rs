//! Port-info notification parser
//!
//! The hub reports attach/detach on the port-info characteristic in two
//! shapes:
//!
//! ```text
//! short: [port, 0x00]                                    detach
//! long:  [port, event, hub id, device type, tail...]     event 0x01 attach,
//!                                                        event 0x00 detach
//! ```
//!
//! Frames are fire-and-forget; anything that does not fit is logged and
//! dropped.

use crate::domain::models::{DeviceType, Port};
use crate::infrastructure::bluetooth::protocol::to_hex;
use tracing::{debug, trace};

const EVENT_DETACHED: u8 = 0x00;
const EVENT_ATTACHED: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEventKind {
    /// Attachment. `None` when the type byte is zero or not a known device,
    /// in which case only active probing can tell what is there.
    Attached(Option<DeviceType>),
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEvent {
    pub port: Port,
    pub kind: PortEventKind,
    pub hub_id: Option<u8>,
    pub type_code: Option<u8>,
    pub tail: Vec<u8>,
}

impl PortEvent {
    /// Confirmed device type, if this is an attachment with a known type.
    pub fn device_type(&self) -> Option<DeviceType> {
        match self.kind {
            PortEventKind::Attached(device_type) => device_type,
            PortEventKind::Detached => None,
        }
    }
}

pub fn parse_port_message(data: &[u8]) -> Option<PortEvent> {
    if data.len() < 2 {
        debug!("Port message too short: [{}]", to_hex(data));
        return None;
    }

    let port = match Port::try_from(data[0]) {
        Ok(port) => port,
        Err(id) => {
            trace!("Ignoring port message for port {}", id);
            return None;
        }
    };

    match data.len() {
        2 => parse_short(port, data[1]),
        3 => {
            debug!("Unrecognized 3-byte port message: [{}]", to_hex(data));
            None
        }
        _ => parse_long(port, data),
    }
}

fn parse_short(port: Port, event: u8) -> Option<PortEvent> {
    if event != EVENT_DETACHED {
        debug!("Unrecognized short port event 0x{:02X} on port {}", event, port);
        return None;
    }
    Some(PortEvent {
        port,
        kind: PortEventKind::Detached,
        hub_id: None,
        type_code: None,
        tail: Vec::new(),
    })
}

fn parse_long(port: Port, data: &[u8]) -> Option<PortEvent> {
    let (event, hub_id, type_code) = (data[1], data[2], data[3]);
    let kind = match event {
        EVENT_ATTACHED => {
            let device_type = DeviceType::from_code(type_code);
            if device_type.is_none() {
                debug!(
                    "Port {}: attachment with unknown device type 0x{:02X}",
                    port, type_code
                );
            }
            PortEventKind::Attached(device_type)
        }
        EVENT_DETACHED => PortEventKind::Detached,
        other => {
            debug!("Unrecognized port event 0x{:02X} on port {}", other, port);
            return None;
        }
    };

    Some(PortEvent {
        port,
        kind,
        hub_id: Some(hub_id),
        type_code: Some(type_code),
        tail: data[4..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_detach() {
        let event = parse_port_message(&[0x01, 0x00]).unwrap();
        assert_eq!(event.port, Port::A);
        assert_eq!(event.kind, PortEventKind::Detached);
        assert!(parse_port_message(&[0x01, 0x05]).is_none());
    }

    #[test]
    fn test_too_short_is_dropped() {
        assert!(parse_port_message(&[]).is_none());
        assert!(parse_port_message(&[0x01]).is_none());
        assert!(parse_port_message(&[0x01, 0x01, 0x00]).is_none());
    }

    #[test]
    fn test_long_attach_with_known_type() {
        let event = parse_port_message(&[0x02, 0x01, 0x00, 0x17, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(event.port, Port::B);
        assert_eq!(event.device_type(), Some(DeviceType::RgbLight));
        assert_eq!(event.hub_id, Some(0x00));
        assert_eq!(event.tail, vec![0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_long_attach_with_unknown_type() {
        let zero = parse_port_message(&[0x01, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(zero.kind, PortEventKind::Attached(None));
        assert_eq!(zero.device_type(), None);

        let unknown = parse_port_message(&[0x01, 0x01, 0x00, 0x42, 0x10]).unwrap();
        assert_eq!(unknown.device_type(), None);
        assert_eq!(unknown.type_code, Some(0x42));
    }

    #[test]
    fn test_long_detach_and_unknown_event() {
        let event = parse_port_message(&[0x06, 0x00, 0x00, 0x17]).unwrap();
        assert_eq!(event.port, Port::Light);
        assert_eq!(event.kind, PortEventKind::Detached);
        assert!(parse_port_message(&[0x01, 0x07, 0x00, 0x01]).is_none());
    }

    #[test]
    fn test_foreign_ports_rejected_before_interpretation() {
        for id in [0u8, 3, 4, 5, 7, 0x32, 0xFF] {
            assert!(parse_port_message(&[id, 0x00]).is_none());
            assert!(parse_port_message(&[id, 0x01, 0x00, 0x01]).is_none());
        }
    }
}
