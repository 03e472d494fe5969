//! Storage format of job payloads: always gzip.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::JobError;

/// Compress `raw` unless it already is a valid gzip stream.
pub fn ingest(raw: &[u8]) -> Bytes {
    if !raw.is_empty() && decompress(raw).is_ok() {
        return Bytes::copy_from_slice(raw);
    }
    compress(raw)
}

/// Read a whole byte stream and [ingest] it.
pub async fn ingest_stream<ReadT>(mut stream: ReadT) -> std::io::Result<Bytes>
where
    ReadT: AsyncRead + Unpin,
{
    let mut raw = vec![];
    stream.read_to_end(&mut raw).await?;
    Ok(ingest(&raw))
}

/// Gzip `raw`.
pub fn compress(raw: &[u8]) -> Bytes {
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 4), Compression::default());
    // Writes into a Vec cannot fail.
    let _ = encoder.write_all(raw);
    Bytes::from(encoder.finish().unwrap_or_default())
}

/// Inflate a gzip stream.
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>, JobError> {
    let mut out = vec![];
    GzDecoder::new(compressed)
        .read_to_end(&mut out)
        .map_err(JobError::Corrupt)?;
    Ok(out)
}
