use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Upper bound on a single frame body.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub seq: u64,
    /// `<endpoint>.<method>`
    pub method: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub seq: u64,
    pub body: Vec<u8>,
    /// Transport-level failure reported by the server. Domain errors travel
    /// inside `body`.
    pub error: Option<String>,
}

/// Reply for calls that convey nothing. The transport still needs a body to
/// decode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Empty;

pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    Ok(postcard::to_stdvec(value)?)
}

pub fn decode_body<T: DeserializeOwned>(raw: &[u8]) -> Result<T, TransportError> {
    Ok(postcard::from_bytes(raw)?)
}

pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = postcard::to_stdvec(msg)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes()).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R, T>(r: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match r.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(postcard::from_bytes(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = RequestFrame {
            seq: 9,
            method: "Datasource.Execute".into(),
            body: vec![1, 2, 3],
        };
        write_frame(&mut client, &request).await.unwrap();
        drop(client);

        let received: RequestFrame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received.seq, 9);
        assert_eq!(received.method, "Datasource.Execute");
        assert_eq!(received.body, vec![1, 2, 3]);
        assert!(read_frame::<_, RequestFrame>(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_BYTES as u32) + 1;
        client.write_all(&len.to_le_bytes()).await.unwrap();
        let err = read_frame::<_, ResponseFrame>(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge(_)));
    }

    #[test]
    fn empty_reply_has_no_bytes() {
        assert!(encode_body(&Empty).unwrap().is_empty());
        decode_body::<Empty>(&[]).unwrap();
    }
}
