//! Application-layer protocol spoken with the ranging accessory.
//!
//! Every frame is `[message-id][payload...]` and travels over a single GATT
//! characteristic in each direction:
//!
//! | id   | message             | direction          | payload                     |
//! |------|---------------------|--------------------|-----------------------------|
//! | 0x01 | `configurationData` | accessory -> app   | accessory configuration     |
//! | 0x02 | `uwbDidStart`       | accessory -> app   | none                        |
//! | 0x03 | `uwbDidStop`        | accessory -> app   | none                        |
//! | 0x04 | `paired`            | accessory -> app   | none                        |
//! | 0x0A | `initialize`        | app -> accessory   | none                        |
//! | 0x0B | `configureAndStart` | app -> accessory   | shareable configuration     |
//! | 0x0C | `stop`              | app -> accessory   | none                        |
//! | 0x2F | `notify`            | accessory -> app   | 3 reserved bytes + UTF-8    |
//!
//! Outbound frames must fit in a single write. A frame larger than the
//! negotiated write limit is rejected rather than cut short: the accessory
//! cannot reassemble fragments, so a truncated configuration would silently
//! corrupt the ranging session.

use thiserror::Error;

/// Number of reserved bytes that precede the text of a `notify` frame.
pub const NOTIFY_RESERVED_LEN: usize = 3;

/// Size of the fixed accessory configuration header.
pub const CONFIGURATION_HEADER_LEN: usize = 16;

/// Accessory configuration major version understood by this engine.
pub const SUPPORTED_CONFIGURATION_MAJOR: u16 = 1;

/// Errors raised while encoding or decoding protocol frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A notification arrived with no bytes at all.
    #[error("received an empty frame")]
    EmptyFrame,

    /// The first byte is not a known message id.
    #[error("unknown message id 0x{0:02X}")]
    UnknownMessageId(u8),

    /// The accessory sent an id that only the app may send.
    #[error("message id 0x{0:02X} is not valid in the accessory-to-app direction")]
    UnexpectedDirection(u8),

    /// A `notify` frame was shorter than its reserved prefix.
    #[error("notify frame is {len} bytes, shorter than the {NOTIFY_RESERVED_LEN}-byte prefix")]
    TruncatedNotify {
        /// Length of the payload that was received.
        len: usize,
    },

    /// The accessory configuration blob could not be parsed.
    #[error("malformed accessory configuration: {reason}")]
    MalformedConfiguration {
        /// What was wrong with the blob.
        reason: String,
    },

    /// An outbound frame does not fit the negotiated write size.
    #[error("frame of {len} bytes exceeds the negotiated write limit of {max} bytes")]
    PayloadTooLarge {
        /// Encoded frame length.
        len: usize,
        /// Maximum frame length the link accepts.
        max: usize,
    },
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Message identifiers defined by the accessory protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    /// Accessory configuration data.
    ConfigurationData = 0x01,
    /// Accessory started ranging.
    UwbDidStart = 0x02,
    /// Accessory stopped ranging.
    UwbDidStop = 0x03,
    /// Accessory completed pairing.
    Paired = 0x04,
    /// App requests the accessory configuration.
    Initialize = 0x0A,
    /// App hands over the shareable configuration and starts ranging.
    ConfigureAndStart = 0x0B,
    /// App stops ranging.
    Stop = 0x0C,
    /// Free-form text from the accessory firmware.
    Notify = 0x2F,
}

impl MessageId {
    /// Whether the accessory is allowed to send this id.
    #[must_use]
    pub const fn is_inbound(self) -> bool {
        matches!(
            self,
            Self::ConfigurationData | Self::UwbDidStart | Self::UwbDidStop | Self::Paired | Self::Notify
        )
    }
}

impl TryFrom<u8> for MessageId {
    type Error = ProtocolError;

    fn try_from(value: u8) -> ProtocolResult<Self> {
        match value {
            0x01 => Ok(Self::ConfigurationData),
            0x02 => Ok(Self::UwbDidStart),
            0x03 => Ok(Self::UwbDidStop),
            0x04 => Ok(Self::Paired),
            0x0A => Ok(Self::Initialize),
            0x0B => Ok(Self::ConfigureAndStart),
            0x0C => Ok(Self::Stop),
            0x2F => Ok(Self::Notify),
            other => Err(ProtocolError::UnknownMessageId(other)),
        }
    }
}

/// A decoded frame received from the accessory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessoryMessage {
    /// Raw accessory configuration; parse with [`AccessoryConfiguration::parse`].
    ConfigurationData(Vec<u8>),
    /// Ranging started on the accessory side.
    UwbDidStart,
    /// Ranging stopped on the accessory side.
    UwbDidStop,
    /// Pairing trigger acknowledged.
    Paired,
    /// Diagnostic text from the firmware.
    Notify(String),
}

impl AccessoryMessage {
    /// Decode a frame received on the notify characteristic.
    ///
    /// # Errors
    ///
    /// Fails on empty frames, unknown ids, app-only ids and short `notify`
    /// frames.
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        let (&id, payload) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let id = MessageId::try_from(id)?;
        if !id.is_inbound() {
            return Err(ProtocolError::UnexpectedDirection(id as u8));
        }

        Ok(match id {
            MessageId::ConfigurationData => Self::ConfigurationData(payload.to_vec()),
            MessageId::UwbDidStart => Self::UwbDidStart,
            MessageId::UwbDidStop => Self::UwbDidStop,
            MessageId::Paired => Self::Paired,
            MessageId::Notify => {
                let text = payload
                    .get(NOTIFY_RESERVED_LEN..)
                    .ok_or(ProtocolError::TruncatedNotify { len: payload.len() })?;
                Self::Notify(String::from_utf8_lossy(text).into_owned())
            }
            MessageId::Initialize | MessageId::ConfigureAndStart | MessageId::Stop => {
                return Err(ProtocolError::UnexpectedDirection(id as u8));
            }
        })
    }

    /// The id this message was framed with.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        match self {
            Self::ConfigurationData(_) => MessageId::ConfigurationData,
            Self::UwbDidStart => MessageId::UwbDidStart,
            Self::UwbDidStop => MessageId::UwbDidStop,
            Self::Paired => MessageId::Paired,
            Self::Notify(_) => MessageId::Notify,
        }
    }
}

/// A frame sent from the app to the accessory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    /// Ask the accessory for its configuration.
    Initialize,
    /// Hand over the locally generated shareable configuration.
    ConfigureAndStart(Vec<u8>),
    /// Stop ranging.
    Stop,
}

impl AppMessage {
    /// The id this message is framed with.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        match self {
            Self::Initialize => MessageId::Initialize,
            Self::ConfigureAndStart(_) => MessageId::ConfigureAndStart,
            Self::Stop => MessageId::Stop,
        }
    }

    /// Encode into a single frame no longer than `max_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] when the frame does not fit.
    pub fn encode(&self, max_len: usize) -> ProtocolResult<Vec<u8>> {
        let payload: &[u8] = match self {
            Self::ConfigureAndStart(data) => data,
            Self::Initialize | Self::Stop => &[],
        };
        let len = payload.len() + 1;
        if len > max_len {
            return Err(ProtocolError::PayloadTooLarge { len, max: max_len });
        }

        let mut frame = Vec::with_capacity(len);
        frame.push(self.id() as u8);
        frame.extend_from_slice(payload);
        Ok(frame)
    }
}

/// Ranging configuration advertised by the accessory in `configurationData`.
///
/// Layout (little-endian):
///
/// ```text
/// major:u16 | minor:u16 | preferred_update_rate:u8 | reserved:[u8; 10] | uwb_len:u8 | uwb[uwb_len]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessoryConfiguration {
    /// Protocol major version.
    pub major_version: u16,
    /// Protocol minor version.
    pub minor_version: u16,
    /// Update rate the accessory would like to range at.
    pub preferred_update_rate: u8,
    /// Opaque UWB configuration consumed by the ranging primitive.
    pub uwb_config: Vec<u8>,
}

impl AccessoryConfiguration {
    /// Parse a `configurationData` payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedConfiguration`] for short, truncated
    /// or overlong payloads, empty UWB configuration and unsupported major
    /// versions.
    pub fn parse(payload: &[u8]) -> ProtocolResult<Self> {
        let malformed = |reason: String| ProtocolError::MalformedConfiguration { reason };

        if payload.len() < CONFIGURATION_HEADER_LEN {
            return Err(malformed(format!(
                "header needs {CONFIGURATION_HEADER_LEN} bytes, got {}",
                payload.len()
            )));
        }

        let major_version = u16::from_le_bytes([payload[0], payload[1]]);
        let minor_version = u16::from_le_bytes([payload[2], payload[3]]);
        let preferred_update_rate = payload[4];
        let uwb_len = usize::from(payload[CONFIGURATION_HEADER_LEN - 1]);
        let body = &payload[CONFIGURATION_HEADER_LEN..];

        if major_version != SUPPORTED_CONFIGURATION_MAJOR {
            return Err(malformed(format!(
                "unsupported major version {major_version}"
            )));
        }
        if uwb_len == 0 {
            return Err(malformed("UWB configuration is empty".to_string()));
        }
        if body.len() != uwb_len {
            return Err(malformed(format!(
                "UWB configuration declares {uwb_len} bytes, payload carries {}",
                body.len()
            )));
        }

        Ok(Self {
            major_version,
            minor_version,
            preferred_update_rate,
            uwb_config: body.to_vec(),
        })
    }

    /// Serialize back into the wire layout. Used by simulated accessories.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONFIGURATION_HEADER_LEN + self.uwb_config.len());
        out.extend_from_slice(&self.major_version.to_le_bytes());
        out.extend_from_slice(&self.minor_version.to_le_bytes());
        out.push(self.preferred_update_rate);
        out.extend_from_slice(&[0u8; 10]);
        out.push(u8::try_from(self.uwb_config.len()).unwrap_or(u8::MAX));
        out.extend_from_slice(&self.uwb_config);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_configuration() -> Vec<u8> {
        AccessoryConfiguration {
            major_version: 1,
            minor_version: 2,
            preferred_update_rate: 10,
            uwb_config: vec![0xAA, 0xBB, 0xCC],
        }
        .to_bytes()
    }

    #[test]
    fn test_decode_simple_messages() {
        assert_eq!(AccessoryMessage::decode(&[0x02]).unwrap(), AccessoryMessage::UwbDidStart);
        assert_eq!(AccessoryMessage::decode(&[0x03]).unwrap(), AccessoryMessage::UwbDidStop);
        assert_eq!(AccessoryMessage::decode(&[0x04]).unwrap(), AccessoryMessage::Paired);
    }

    #[test]
    fn test_decode_configuration_keeps_payload() {
        let mut frame = vec![0x01];
        frame.extend_from_slice(&[1, 2, 3]);
        assert_eq!(
            AccessoryMessage::decode(&frame).unwrap(),
            AccessoryMessage::ConfigurationData(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_decode_notify_skips_reserved_bytes() {
        let mut frame = vec![0x2F, 0, 0, 0];
        frame.extend_from_slice(b"battery low");
        assert_eq!(
            AccessoryMessage::decode(&frame).unwrap(),
            AccessoryMessage::Notify("battery low".to_string())
        );
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert_eq!(AccessoryMessage::decode(&[]), Err(ProtocolError::EmptyFrame));
        assert_eq!(
            AccessoryMessage::decode(&[0x7E]),
            Err(ProtocolError::UnknownMessageId(0x7E))
        );
        assert_eq!(
            AccessoryMessage::decode(&[0x0A]),
            Err(ProtocolError::UnexpectedDirection(0x0A))
        );
        assert_eq!(
            AccessoryMessage::decode(&[0x2F, 0]),
            Err(ProtocolError::TruncatedNotify { len: 1 })
        );
    }

    #[test]
    fn test_encode_frames() {
        assert_eq!(AppMessage::Initialize.encode(20).unwrap(), vec![0x0A]);
        assert_eq!(AppMessage::Stop.encode(20).unwrap(), vec![0x0C]);
        assert_eq!(
            AppMessage::ConfigureAndStart(vec![9, 8]).encode(20).unwrap(),
            vec![0x0B, 9, 8]
        );
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let msg = AppMessage::ConfigureAndStart(vec![0; 20]);
        assert_eq!(
            msg.encode(20),
            Err(ProtocolError::PayloadTooLarge { len: 21, max: 20 })
        );
    }

    #[test]
    fn test_parse_configuration() {
        let config = AccessoryConfiguration::parse(&sample_configuration()).unwrap();
        assert_eq!(config.major_version, 1);
        assert_eq!(config.minor_version, 2);
        assert_eq!(config.preferred_update_rate, 10);
        assert_eq!(config.uwb_config, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_parse_truncated_configuration_fails() {
        let bytes = sample_configuration();
        for cut in [0, 5, CONFIGURATION_HEADER_LEN, bytes.len() - 1] {
            let err = AccessoryConfiguration::parse(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedConfiguration { .. }));
        }
    }

    #[test]
    fn test_parse_rejects_unknown_major_and_trailing_bytes() {
        let mut bytes = sample_configuration();
        bytes[0] = 2;
        assert!(AccessoryConfiguration::parse(&bytes).is_err());

        let mut bytes = sample_configuration();
        bytes.push(0xFF);
        assert!(AccessoryConfiguration::parse(&bytes).is_err());
    }
}
