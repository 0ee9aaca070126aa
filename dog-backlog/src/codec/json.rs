use crate::codec::PayloadCodec;
use crate::types::{DeadLetterRecord, WorkPayload};
use crate::CoordResult;

/// JSON codec for payloads and dead-letter records
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode_payload(&self, payload: &WorkPayload) -> CoordResult<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }

    fn decode_payload(&self, bytes: &[u8]) -> CoordResult<WorkPayload> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_dead_letter(&self, record: &DeadLetterRecord) -> CoordResult<Vec<u8>> {
        Ok(serde_json::to_vec(record)?)
    }

    fn codec_id(&self) -> &'static str {
        "json"
    }
}
