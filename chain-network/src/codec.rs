//! Length-prefixed framing for consensus messages

use crate::{NetworkError, NetworkResult};
use bytes::Bytes;
use chain_consensus::SignedConsensusMessage;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Framed stream carrying one JSON-encoded message per frame
pub type MessageStream<T> = Framed<T, LengthDelimitedCodec>;

/// Wrap an I/O stream with a 4-byte big-endian length prefix codec
pub fn framed<T>(io: T, max_frame_size: usize) -> MessageStream<T>
where
    T: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_size)
        .new_codec();
    Framed::new(io, codec)
}

/// Read the next message, `None` when the peer closed the stream
pub async fn read_message<T>(
    stream: &mut MessageStream<T>,
) -> NetworkResult<Option<SignedConsensusMessage>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match stream.next().await {
        Some(frame) => {
            let frame = frame?;
            Ok(Some(SignedConsensusMessage::decode(&frame)?))
        }
        None => Ok(None),
    }
}

pub async fn write_message<T>(
    stream: &mut MessageStream<T>,
    message: &SignedConsensusMessage,
) -> NetworkResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = message.encode()?;
    stream
        .send(Bytes::from(bytes))
        .await
        .map_err(NetworkError::from)
}
