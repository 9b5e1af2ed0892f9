//! Protobuf frames for the long-connection protocol, plus the fragment
//! assembler for payloads split across frames.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use prost::Message;

pub const METHOD_CONTROL: i32 = 0;
pub const METHOD_DATA: i32 = 1;

pub const HEADER_TYPE: &str = "type";
pub const HEADER_MESSAGE_ID: &str = "message_id";
pub const HEADER_SUM: &str = "sum";
pub const HEADER_SEQ: &str = "seq";
pub const HEADER_BIZ_RT: &str = "biz_rt";

pub const TYPE_EVENT: &str = "event";
pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";

/// Unassembled fragments expire quickly; the platform resends.
const FRAGMENT_TTL: Duration = Duration::from_secs(5);

#[derive(Clone, PartialEq, Message)]
pub struct WsHeader {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct WsFrame {
    #[prost(uint64, tag = "1")]
    pub seq_id: u64,
    #[prost(uint64, tag = "2")]
    pub log_id: u64,
    #[prost(int32, tag = "3")]
    pub service: i32,
    #[prost(int32, tag = "4")]
    pub method: i32,
    #[prost(message, repeated, tag = "5")]
    pub headers: Vec<WsHeader>,
    #[prost(string, tag = "6")]
    pub payload_encoding: String,
    #[prost(string, tag = "7")]
    pub payload_type: String,
    #[prost(bytes = "vec", tag = "8")]
    pub payload: Vec<u8>,
    #[prost(string, tag = "9")]
    pub log_id_new: String,
}

impl WsFrame {
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }

    #[must_use]
    pub fn header_usize(&self, key: &str) -> Option<usize> {
        self.header(key).and_then(|v| v.parse().ok())
    }

    pub fn set_header(&mut self, key: &str, value: String) {
        if let Some(header) = self.headers.iter_mut().find(|h| h.key == key) {
            header.value = value;
        } else {
            self.headers.push(WsHeader {
                key: key.to_string(),
                value,
            });
        }
    }

    #[must_use]
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buffer).expect("vec write cannot fail");
        buffer
    }

    pub fn decode_from(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }
}

/// Build a control ping frame for the service.
#[must_use]
pub fn ping_frame(service_id: i32) -> WsFrame {
    WsFrame {
        service: service_id,
        method: METHOD_CONTROL,
        headers: vec![WsHeader {
            key: HEADER_TYPE.to_string(),
            value: TYPE_PING.to_string(),
        }],
        ..Default::default()
    }
}

struct PendingChunks {
    expires_at: Instant,
    chunks: Vec<Option<Vec<u8>>>,
}

/// Reassembles payloads fragmented across `sum`/`seq` frames.
#[derive(Default)]
pub struct PayloadAssembler {
    pending: HashMap<String, PendingChunks>,
}

impl PayloadAssembler {
    /// Feed one fragment; returns the complete payload once all parts
    /// have arrived.
    pub fn merge(
        &mut self,
        message_id: &str,
        sum: usize,
        seq: usize,
        payload: Vec<u8>,
    ) -> Option<Vec<u8>> {
        if message_id.trim().is_empty() || sum <= 1 || seq >= sum {
            return Some(payload);
        }
        self.prune_expired();

        let expires_at = Instant::now() + FRAGMENT_TTL;
        let entry = self
            .pending
            .entry(message_id.to_string())
            .or_insert_with(|| PendingChunks {
                expires_at,
                chunks: vec![None; sum],
            });
        if entry.chunks.len() != sum {
            entry.chunks = vec![None; sum];
        }
        entry.expires_at = expires_at;
        entry.chunks[seq] = Some(payload);

        if entry.chunks.iter().any(Option::is_none) {
            return None;
        }
        let mut output = Vec::new();
        for chunk in &mut entry.chunks {
            if let Some(bytes) = chunk.take() {
                output.extend(bytes);
            }
        }
        self.pending.remove(message_id);
        Some(output)
    }

    fn prune_expired(&mut self) {
        let now = Instant::now();
        self.pending.retain(|_, entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_protobuf() {
        let mut frame = WsFrame {
            seq_id: 7,
            service: 42,
            method: METHOD_DATA,
            payload: b"{\"x\":1}".to_vec(),
            ..Default::default()
        };
        frame.set_header(HEADER_TYPE, TYPE_EVENT.to_string());
        frame.set_header(HEADER_MESSAGE_ID, "mid".to_string());

        let bytes = frame.encode_to_bytes();
        let decoded = WsFrame::decode_from(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.header(HEADER_TYPE), Some(TYPE_EVENT));
        assert_eq!(decoded.header(HEADER_MESSAGE_ID), Some("mid"));
    }

    #[test]
    fn set_header_replaces_existing_values() {
        let mut frame = ping_frame(3);
        assert_eq!(frame.header(HEADER_TYPE), Some(TYPE_PING));
        frame.set_header(HEADER_TYPE, TYPE_PONG.to_string());
        assert_eq!(frame.header(HEADER_TYPE), Some(TYPE_PONG));
        assert_eq!(frame.headers.len(), 1);
    }

    #[test]
    fn assembler_passes_unfragmented_payloads_through() {
        let mut assembler = PayloadAssembler::default();
        assert_eq!(
            assembler.merge("m", 1, 0, b"whole".to_vec()),
            Some(b"whole".to_vec())
        );
    }

    #[test]
    fn assembler_joins_fragments_in_seq_order() {
        let mut assembler = PayloadAssembler::default();
        assert!(assembler.merge("m", 3, 1, b"bb".to_vec()).is_none());
        assert!(assembler.merge("m", 3, 0, b"aa".to_vec()).is_none());
        let whole = assembler.merge("m", 3, 2, b"cc".to_vec()).unwrap();
        assert_eq!(whole, b"aabbcc");
        // the entry is consumed
        assert!(assembler.merge("m", 3, 0, b"x".to_vec()).is_none());
    }
}
