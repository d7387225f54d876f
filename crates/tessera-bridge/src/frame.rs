// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Framing: a 4-byte little-endian length header followed by UTF-8 JSON.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use tessera_core::TesseraError;

use crate::message::BridgeMessage;

pub type FramedStream<T> = Framed<T, LengthDelimitedCodec>;

/// Codec rejecting frames whose body exceeds `max_frame_bytes`.
pub fn codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .little_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

pub fn framed<T>(io: T, max_frame_bytes: usize) -> FramedStream<T>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, codec(max_frame_bytes))
}

pub fn encode(message: &BridgeMessage) -> Result<Bytes, TesseraError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode(frame: &[u8]) -> Result<BridgeMessage, TesseraError> {
    serde_json::from_slice(frame).map_err(|e| TesseraError::transport("malformed bridge frame", e))
}

pub async fn send<T>(stream: &mut FramedStream<T>, message: &BridgeMessage) -> Result<(), TesseraError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = encode(message)?;
    stream
        .send(bytes)
        .await
        .map_err(|e| TesseraError::transport(format!("failed to send {}", message.kind()), e))
}

/// Next message, or `None` when the peer closed the connection.
pub async fn recv<T>(stream: &mut FramedStream<T>) -> Result<Option<BridgeMessage>, TesseraError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match stream.next().await {
        Some(Ok(frame)) => decode(&frame).map(Some),
        Some(Err(e)) => Err(TesseraError::transport("failed to read bridge frame", e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn header_is_little_endian_length() {
        let (client, mut server) = duplex(1024);
        let mut client = framed(client, 1024);
        let message = BridgeMessage::Ping {
            request_id: "r1".into(),
        };
        send(&mut client, &message).await.unwrap();

        let body = encode(&message).unwrap();
        let mut header = [0u8; 4];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(u32::from_le_bytes(header) as usize, body.len());
        let mut payload = vec![0u8; body.len()];
        server.read_exact(&mut payload).await.unwrap();
        assert_eq!(decode(&payload).unwrap(), message);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut client, server) = duplex(4096);
        let mut server = framed(server, 16);
        let body = vec![b'x'; 64];
        client.write_all(&(body.len() as u32).to_le_bytes()).await.unwrap();
        client.write_all(&body).await.unwrap();

        let err = recv(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), tessera_core::ErrorKind::Transport);
    }

    #[tokio::test]
    async fn closed_peer_reads_none() {
        let (client, server) = duplex(64);
        drop(client);
        let mut server = framed(server, 64);
        assert!(recv(&mut server).await.unwrap().is_none());
    }
}
