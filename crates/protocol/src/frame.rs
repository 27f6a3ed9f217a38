//! Length-prefixed JSON frames over `LengthDelimitedCodec`: a big-endian
//! `u32` body length, then the body.

use {
    bytes::Bytes,
    futures::{SinkExt, StreamExt},
    serde::{Serialize, de::DeserializeOwned},
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_util::codec::{Framed, LengthDelimitedCodec, LengthDelimitedCodecError},
};

use crate::MAX_FRAME_LEN;

/// A byte stream speaking length-prefixed frames.
///
/// Bytes read past the last decoded frame stay in
/// [`Framed::read_buffer_mut`]; callers switching to raw I/O drain it first.
pub type FrameStream<S> = Framed<S, LengthDelimitedCodec>;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
    TooLarge,

    #[error("connection closed before a complete frame")]
    Closed,

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Codec enforcing [`MAX_FRAME_LEN`] in both directions.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn framed<S: AsyncRead + AsyncWrite>(io: S) -> FrameStream<S> {
    Framed::new(io, codec())
}

/// Serialize `value` and send it as one frame, then flush.
pub async fn write_frame<S, T>(stream: &mut FrameStream<S>, value: &T) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    stream.send(Bytes::from(body)).await?;
    Ok(())
}

/// Receive one frame and deserialize it.
pub async fn read_frame<S, T>(stream: &mut FrameStream<S>) -> Result<T, FrameError>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        Some(Ok(body)) => Ok(serde_json::from_slice(&body)?),
        Some(Err(e)) if is_oversized(&e) => Err(FrameError::TooLarge),
        Some(Err(e)) => Err(e.into()),
        None => Err(FrameError::Closed),
    }
}

fn is_oversized(err: &std::io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{Ack, Header, PROTOCOL_VERSION};

    #[tokio::test]
    async fn header_then_ack_over_duplex() {
        let (dialer, acceptor) = tokio::io::duplex(1024);
        let (mut dialer, mut acceptor) = (framed(dialer), framed(acceptor));

        let header = Header::Session {
            version: PROTOCOL_VERSION,
            address: "127.0.0.1:4000".into(),
        };
        write_frame(&mut dialer, &header).await.unwrap();
        let got: Header = read_frame(&mut acceptor).await.unwrap();
        assert_eq!(got, header);

        write_frame(&mut acceptor, &Ack::accepted()).await.unwrap();
        let ack: Ack = read_frame(&mut dialer).await.unwrap();
        assert_eq!(ack, Ack::accepted());
    }

    #[tokio::test]
    async fn bytes_after_a_frame_stay_buffered() {
        let (mut raw, acceptor) = tokio::io::duplex(1024);
        let mut acceptor = framed(acceptor);

        let body = serde_json::to_vec(&Ack::accepted()).unwrap();
        raw.write_u32(body.len() as u32).await.unwrap();
        raw.write_all(&body).await.unwrap();
        raw.write_all(b"trailing").await.unwrap();
        drop(raw);

        let ack: Ack = read_frame(&mut acceptor).await.unwrap();
        assert_eq!(ack, Ack::accepted());
        assert_eq!(&acceptor.read_buffer_mut()[..], b"trailing");
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_reading_body() {
        let (mut raw, b) = tokio::io::duplex(64);
        let mut b = framed(b);
        raw.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();
        let err = read_frame::<_, Ack>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge), "{err}");
    }

    #[tokio::test]
    async fn oversized_value_is_not_sent() {
        let (a, _b) = tokio::io::duplex(64);
        let mut a = framed(a);
        let huge = "x".repeat(MAX_FRAME_LEN);
        let err = write_frame(&mut a, &huge).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge));
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let (mut raw, b) = tokio::io::duplex(64);
        let mut b = framed(b);
        raw.write_u32(3).await.unwrap();
        raw.write_all(&[1, 2, 3]).await.unwrap();
        let err = read_frame::<_, Header>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (mut raw, b) = tokio::io::duplex(64);
        let mut b = framed(b);
        raw.write_u32(10).await.unwrap();
        raw.write_all(b"{}").await.unwrap();
        drop(raw);
        let err = read_frame::<_, Header>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_) | FrameError::Closed), "{err}");
    }

    #[tokio::test]
    async fn clean_close_is_closed() {
        let (raw, b) = tokio::io::duplex(64);
        let mut b = framed(b);
        drop(raw);
        let err = read_frame::<_, Header>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Closed));
    }
}
