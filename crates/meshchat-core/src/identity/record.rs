//! Identify record wire format
//!
//! A response is a 4-byte big-endian length followed by exactly that many
//! bytes of a bincode-encoded [`IdentifyRecord`]. The requester sends nothing.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::IdentityFetchError;

/// Width of the length prefix in bytes
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Identity and capability metadata a peer reports about itself
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentifyRecord {
    pub public_key: Vec<u8>,
    pub protocol_version: String,
    pub agent_version: String,
    pub listen_addrs: Vec<String>,
    pub protocols: Vec<String>,
}

impl IdentifyRecord {
    /// Length-prefixed frame ready to be written to a stream
    pub fn encode_frame(&self) -> Result<Vec<u8>, bincode::Error> {
        let body = bincode::serialize(self)?;
        let len = u32::try_from(body.len()).map_err(|_| {
            Box::new(bincode::ErrorKind::Custom(format!(
                "identify record of {} bytes does not fit a u32 prefix",
                body.len()
            )))
        })?;
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// Read one framed record, rejecting frames longer than `max_len`
pub async fn read_identify_record<R>(reader: &mut R, max_len: usize) -> Result<IdentifyRecord, IdentityFetchError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(IdentityFetchError::EmptyResponse)
        }
        Err(err) => return Err(IdentityFetchError::Read(err)),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(IdentityFetchError::EmptyResponse);
    }
    if len > max_len {
        return Err(IdentityFetchError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

/// Write one framed record and flush
pub async fn write_identify_record<W>(writer: &mut W, record: &IdentifyRecord) -> Result<(), IdentityFetchError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = record.encode_frame()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
