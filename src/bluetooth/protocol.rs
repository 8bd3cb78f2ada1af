//! AnoGram GATT Protocol
//!
//! Service layout, advertisement constants and the text frame codec used on
//! the message characteristic.

use std::time::Duration;
use uuid::Uuid;

use crate::message::MeshMessage;

/// Primary service advertised by every mesh node
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FFFF_0000_1000_8000_00805F9B34FB);

/// Message channel: readable, writable and notifiable
pub const MESSAGE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000FFFD_0000_1000_8000_00805F9B34FB);

/// Optional peer-info channel: `{connected-count}|{device model}`
pub const PEER_INFO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000FFFC_0000_1000_8000_00805F9B34FB);

/// Application name carried in advertisements and used by the scan filter
pub const ADVERTISE_NAME: &str = "AnoGram";

/// Value returned when the message characteristic is read
pub const IDENTITY: &str = ADVERTISE_NAME;

/// Largest attribute value BLE allows in a single write
pub const MAX_FRAME_LEN: usize = 512;

/// Maximum number of relay steps a message may take
pub const MAX_RELAY_HOPS: u32 = 7;

/// Low-latency advertising cadence
pub const ADVERTISE_INTERVAL: Duration = Duration::from_millis(100);

/// Default dial bound
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Field separator of the message frame
pub const FIELD_DELIMITER: char = '|';

/// Number of fields a frame must carry to decode
const FRAME_FIELDS: usize = 6;

/// Frame codec for the message characteristic
///
/// A frame is the UTF-8 text `id|senderId|senderName|content|timestamp|hopCount`.
/// Fields are neither escaped nor length-prefixed: content containing the
/// delimiter produces a frame that peers running the same codec cannot read
/// back faithfully. Decoding fails closed and never reports why.
pub struct MeshProtocol;

impl MeshProtocol {
    /// Encode a message into a frame
    pub fn encode(message: &MeshMessage) -> Vec<u8> {
        format!(
            "{id}{d}{sender_id}{d}{sender_name}{d}{content}{d}{timestamp}{d}{hop_count}",
            id = message.id,
            sender_id = message.sender_id,
            sender_name = message.sender_name,
            content = message.content,
            timestamp = message.timestamp,
            hop_count = message.hop_count,
            d = FIELD_DELIMITER,
        )
        .into_bytes()
    }

    /// Decode a frame; `None` for anything that is not a well-formed message
    pub fn decode(data: &[u8]) -> Option<MeshMessage> {
        let text = std::str::from_utf8(data).ok()?;
        let fields: Vec<&str> = text.split(FIELD_DELIMITER).collect();

        if fields.len() < FRAME_FIELDS {
            return None;
        }

        let timestamp = fields[4].parse::<i64>().ok()?;
        let hop_count = fields[5].parse::<u32>().ok()?;

        Some(MeshMessage {
            id: fields[0].to_string(),
            sender_id: fields[1].to_string(),
            sender_name: fields[2].to_string(),
            content: fields[3].to_string(),
            timestamp,
            hop_count,
            // Relay state is not on the wire; any hop implies a relay step.
            is_relayed: hop_count > 0,
            is_delivered: false,
        })
    }

    /// Encode the peer-info characteristic value
    pub fn encode_peer_info(connected_peers: usize, device_model: &str) -> Vec<u8> {
        format!("{}{}{}", connected_peers, FIELD_DELIMITER, device_model).into_bytes()
    }
}
