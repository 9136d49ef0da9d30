//! # Meshtastic Device Communication Module
//!
//! Everything that touches the device byte stream lives here:
//!
//! - [`framer`]: the `0x94 0xC3` length-prefixed protobuf framing used on serial and TCP
//! - [`link`]: TCP and serial connectors producing async byte streams
//! - [`transport`]: the connection state machine, single writer, heartbeats and
//!   reconnect backoff
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshbridge::config::DeviceConfig;
//! use meshbridge::meshtastic::link::connector_for;
//! use meshbridge::meshtastic::transport::{LinkEvent, Transport, TransportSettings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = DeviceConfig::default();
//!     let (transport, mut events) =
//!         Transport::new(connector_for(&device)?, TransportSettings::from(&device));
//!     transport.connect().await;
//!     while let Some(event) = events.recv().await {
//!         if let LinkEvent::CaptureComplete { generation } = event {
//!             println!("device ready (generation {generation})");
//!             break;
//!         }
//!     }
//!     transport.user_disconnect().await;
//!     Ok(())
//! }
//! ```
pub mod framer;
pub mod link;
pub mod transport;

/// Destination address for channel broadcasts.
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Random non-zero packet id. Zero means "unassigned" to the firmware.
pub fn new_packet_id() -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_are_nonzero_and_vary() {
        let ids: std::collections::HashSet<u32> = (0..64).map(|_| new_packet_id()).collect();
        assert!(!ids.contains(&0));
        assert!(ids.len() > 1);
    }
}
