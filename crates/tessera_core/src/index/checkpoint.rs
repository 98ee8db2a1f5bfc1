//! CBOR encoding of index checkpoints.

use super::{IndexMetadata, Tuple, TupleMap};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

const CHECKPOINT_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    version: u8,
    metadata: IndexMetadata,
    tuples: Vec<(Vec<u8>, Tuple)>,
}

/// Serializes an index's metadata and tuples.
pub(crate) fn encode_checkpoint(metadata: &IndexMetadata, tuples: &TupleMap) -> CoreResult<Vec<u8>> {
    let record = CheckpointRecord {
        version: CHECKPOINT_VERSION,
        metadata: metadata.clone(),
        tuples: tuples
            .iter()
            .map(|(key, tuple)| (key.clone(), tuple.clone()))
            .collect(),
    };
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&record, &mut buf)
        .map_err(|e| CoreError::codec(format!("checkpoint encode: {e}")))?;
    Ok(buf)
}

/// Parses a checkpoint written by [`encode_checkpoint`].
pub(crate) fn decode_checkpoint(data: &[u8]) -> CoreResult<(IndexMetadata, TupleMap)> {
    let record: CheckpointRecord = ciborium::de::from_reader(data)
        .map_err(|e| CoreError::codec(format!("checkpoint decode: {e}")))?;
    if record.version != CHECKPOINT_VERSION {
        return Err(CoreError::codec(format!(
            "unsupported checkpoint version {}",
            record.version
        )));
    }
    Ok((record.metadata, record.tuples.into_iter().collect()))
}
