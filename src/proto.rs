//! Control-plane verbs and payload codecs for the bonding layer.
//!
//! The bonding layer adds three verbs to the enclosing overlay packet
//! format. Cryptographic framing and the outer header belong to the
//! enclosing node; this module only defines the payloads, all multi-byte
//! fields in network byte order (big-endian):
//!
//! - **ECHO**: payload-less heartbeat.
//! - **QOS_MEASUREMENT**: a sequence of `(uint64 packet_id, uint16
//!   holding_time_ms)` records, at most [`QOS_TABLE_SIZE`] records and
//!   [`QOS_MAX_PACKET_SIZE`] bytes.
//! - **PATH_NEGOTIATION_REQUEST**: a single `int16` utility value.

/// Maximum payload of a QOS_MEASUREMENT packet.
pub const QOS_MAX_PACKET_SIZE: usize = 1400;

/// Maximum records per QOS_MEASUREMENT packet.
pub const QOS_TABLE_SIZE: usize = 128;

/// Wire size of one QoS record: 8-byte packet id + 2-byte holding time.
pub const QOS_RECORD_LEN: usize = 10;

/// Only packet ids with a non-zero residue modulo this divisor are tracked
/// for QoS accounting.
pub const ACK_DIVISOR: u64 = 8;

/// Verbs of the enclosing packet format the bonding layer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Unicast data frame.
    Frame,
    /// Extended data frame.
    ExtFrame,
    /// Bond heartbeat.
    Echo,
    /// Acknowledgement (excluded from QoS tracking).
    Ack,
    /// QoS report (excluded from QoS tracking).
    QosMeasurement,
    /// Path negotiation petition.
    PathNegotiationRequest,
}

impl Verb {
    /// Whether this verb counts as peer traffic for liveness and packet
    /// counters.
    pub fn is_frame(self) -> bool {
        matches!(self, Verb::Frame | Verb::ExtFrame | Verb::Echo)
    }

    /// Whether packets of this verb participate in QoS round-trip
    /// accounting.
    pub fn tracks_qos(self) -> bool {
        !matches!(self, Verb::Ack | Verb::QosMeasurement)
    }
}

/// Whether a packet id is sampled for QoS accounting.
pub fn qos_eligible_packet_id(packet_id: u64) -> bool {
    packet_id & (ACK_DIVISOR - 1) != 0
}

/// One entry of a QOS_MEASUREMENT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosRecord {
    pub packet_id: u64,
    /// How long the reporter held the packet id before reporting it.
    pub holding_time_ms: u16,
}

/// Payload-codec errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated QoS record: {0} trailing bytes")]
    TruncatedRecord(usize),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("invalid payload length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Encode QoS records, truncating to the table-size and packet-size caps.
pub fn encode_qos_records(records: &[QosRecord]) -> Vec<u8> {
    let count = records
        .len()
        .min(QOS_TABLE_SIZE)
        .min(QOS_MAX_PACKET_SIZE / QOS_RECORD_LEN);
    let mut buf = Vec::with_capacity(count * QOS_RECORD_LEN);
    for record in &records[..count] {
        buf.extend_from_slice(&record.packet_id.to_be_bytes());
        buf.extend_from_slice(&record.holding_time_ms.to_be_bytes());
    }
    buf
}

/// Decode a QOS_MEASUREMENT payload. Truncated trailing records and
/// oversized payloads are rejected.
pub fn decode_qos_records(buf: &[u8]) -> Result<Vec<QosRecord>, ProtocolError> {
    if buf.len() > QOS_MAX_PACKET_SIZE {
        return Err(ProtocolError::PayloadTooLarge(buf.len()));
    }
    if buf.len() % QOS_RECORD_LEN != 0 {
        return Err(ProtocolError::TruncatedRecord(buf.len() % QOS_RECORD_LEN));
    }
    let mut records = Vec::with_capacity(buf.len() / QOS_RECORD_LEN);
    for chunk in buf.chunks_exact(QOS_RECORD_LEN) {
        let packet_id = u64::from_be_bytes(chunk[..8].try_into().unwrap());
        let holding_time_ms = u16::from_be_bytes(chunk[8..].try_into().unwrap());
        records.push(QosRecord {
            packet_id,
            holding_time_ms,
        });
    }
    Ok(records)
}

/// Encode a PATH_NEGOTIATION_REQUEST payload.
pub fn encode_utility(utility: i16) -> [u8; 2] {
    utility.to_be_bytes()
}

/// Decode a PATH_NEGOTIATION_REQUEST payload.
pub fn decode_utility(buf: &[u8]) -> Result<i16, ProtocolError> {
    if buf.len() != 2 {
        return Err(ProtocolError::InvalidLength {
            expected: 2,
            actual: buf.len(),
        });
    }
    Ok(i16::from_be_bytes([buf[0], buf[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_record_roundtrip() {
        let records = vec![
            QosRecord {
                packet_id: 0x1122_3344_5566_7788,
                holding_time_ms: 250,
            },
            QosRecord {
                packet_id: 0x1234,
                holding_time_ms: 0,
            },
        ];

        let encoded = encode_qos_records(&records);
        assert_eq!(encoded.len(), 2 * QOS_RECORD_LEN);
        // Network byte order on the wire.
        assert_eq!(encoded[0], 0x11);
        assert_eq!(&encoded[8..10], &250u16.to_be_bytes());

        let decoded = decode_qos_records(&encoded).expect("decode failed");
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_qos_encode_caps_record_count() {
        let records = vec![
            QosRecord {
                packet_id: 1,
                holding_time_ms: 1,
            };
            QOS_TABLE_SIZE + 50
        ];
        let encoded = encode_qos_records(&records);
        assert_eq!(encoded.len(), QOS_TABLE_SIZE * QOS_RECORD_LEN);
        assert!(encoded.len() <= QOS_MAX_PACKET_SIZE);
    }

    #[test]
    fn test_qos_decode_rejects_truncated_record() {
        let mut encoded = encode_qos_records(&[QosRecord {
            packet_id: 7,
            holding_time_ms: 7,
        }]);
        encoded.pop();
        let result = decode_qos_records(&encoded);
        assert!(matches!(result, Err(ProtocolError::TruncatedRecord(_))));
    }

    #[test]
    fn test_qos_decode_rejects_oversized_payload() {
        let buf = vec![0u8; QOS_MAX_PACKET_SIZE + QOS_RECORD_LEN];
        let result = decode_qos_records(&buf);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge(_))));
    }

    #[test]
    fn test_utility_roundtrip() {
        for utility in [i16::MIN, -1, 0, 1, i16::MAX] {
            let encoded = encode_utility(utility);
            assert_eq!(decode_utility(&encoded).unwrap(), utility);
        }
        assert!(matches!(
            decode_utility(&[1, 2, 3]),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_qos_sampling_skips_aligned_packet_ids() {
        assert!(!qos_eligible_packet_id(0));
        assert!(!qos_eligible_packet_id(8));
        assert!(!qos_eligible_packet_id(64));
        assert!(qos_eligible_packet_id(1));
        assert!(qos_eligible_packet_id(0x1234));
    }

    #[test]
    fn test_verb_classification() {
        assert!(Verb::Frame.is_frame());
        assert!(Verb::Echo.is_frame());
        assert!(!Verb::Ack.is_frame());

        assert!(Verb::Frame.tracks_qos());
        assert!(!Verb::Ack.tracks_qos());
        assert!(!Verb::QosMeasurement.tracks_qos());
    }
}
