pub mod json;

use crate::types::{DeadLetterRecord, WorkPayload};
use crate::CoordResult;

/// Wire encoding for work payloads and dead-letter records
pub trait PayloadCodec: Send + Sync {
    fn encode_payload(&self, payload: &WorkPayload) -> CoordResult<Vec<u8>>;

    fn decode_payload(&self, bytes: &[u8]) -> CoordResult<WorkPayload>;

    fn encode_dead_letter(&self, record: &DeadLetterRecord) -> CoordResult<Vec<u8>>;

    /// Get codec identifier, stamped on each message as the `codec` attribute
    fn codec_id(&self) -> &'static str;
}
