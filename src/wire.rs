//! Message framing: 4-byte big-endian length prefix + encoded envelope.
//!
//! Every logical message travels on its own sub-stream of a multiplexed
//! session, so a frame is read from the very start of the stream and the
//! stream is closed once the single write completes. The reader fails
//! closed on zero-length and oversize frames.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use prost::Message;

use crate::error::WireError;
use crate::proto::Envelope;

pub use crate::error::MAX_FRAME_LEN;

/// Header bytes preceding every frame.
const HEADER_LEN: usize = 4;

/// Encode an envelope into one frame: header + payload.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let payload_len = envelope.encoded_len();
    if payload_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload_len));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len);
    frame.extend_from_slice(&(payload_len as u32).to_be_bytes());
    envelope.encode(&mut frame)?;
    Ok(frame)
}

/// Read exactly one framed envelope from a sub-stream.
///
/// Partial reads loop until the full length is available.
pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let payload_len = u32::from_be_bytes(header) as usize;

    if payload_len == 0 {
        return Err(WireError::EmptyFrame);
    }
    if payload_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    Ok(Envelope::decode(payload.as_slice())?)
}

/// Write one framed envelope as a single write, then flush.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    fn sample() -> Envelope {
        Envelope::new("127.0.0.1:6000".into(), "test", b"hello world".to_vec())
    }

    #[test]
    fn header_is_big_endian_length() {
        let envelope = sample();
        let frame = encode_frame(&envelope).unwrap();
        let expected = envelope.encoded_len() as u32;
        assert_eq!(frame[..4], expected.to_be_bytes());
        assert_eq!(frame.len(), 4 + envelope.encoded_len());
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (writer, reader) = tokio::io::duplex(4096);
        let (mut writer, mut reader) = (writer.compat(), reader.compat());

        let envelope = sample();
        let expected = envelope.clone();

        let write_handle = tokio::spawn(async move {
            write_frame(&mut writer, &envelope).await.unwrap();
        });

        let decoded = read_frame(&mut reader).await.unwrap();
        write_handle.await.unwrap();

        assert_eq!(decoded, expected);
    }

    #[tokio::test]
    async fn zero_length_rejected() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut reader = reader.compat();

        tokio::io::AsyncWriteExt::write_all(&mut writer, &0u32.to_be_bytes())
            .await
            .unwrap();

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::EmptyFrame)
        ));
    }

    #[tokio::test]
    async fn oversize_length_rejected() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut reader = reader.compat();

        let declared = (MAX_FRAME_LEN as u32) + 1;
        tokio::io::AsyncWriteExt::write_all(&mut writer, &declared.to_be_bytes())
            .await
            .unwrap();

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut reader = reader.compat();

        tokio::io::AsyncWriteExt::write_all(&mut writer, &100u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut writer, &[1, 2, 3])
            .await
            .unwrap();
        drop(writer);

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::Io(_))
        ));
    }
}
