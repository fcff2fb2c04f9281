//! Wire framing for the peer RPC protocol.
//!
//! Every request and response body crosses the stream as one frame: a
//! big-endian `u32` length followed by that many bytes. The bodies are
//! opaque at this layer; the rpc crate decodes them.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use libp2p::futures::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::StreamProtocol;
use thiserror::Error;

const PREFIX_LEN: usize = 4;

/// A framing violation on a peer RPC stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    Oversize { len: usize, limit: usize },
}

impl From<FrameError> for io::Error {
    fn from(e: FrameError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// An undecoded peer RPC request body.
#[derive(Clone, Debug)]
pub struct RawRequest(pub Bytes);

/// An undecoded peer RPC response body.
#[derive(Clone, Debug)]
pub struct RawResponse(pub Bytes);

/// Codec for `/koinos/peerrpc/1.0.0` streams.
///
/// One limit bounds frames in both directions; it tracks the configured
/// maximum RPC message size, which the largest download batch must fit in.
#[derive(Copy, Clone, Debug)]
pub struct Codec {
    max_frame: usize,
}

impl Codec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    async fn recv_frame<T>(&self, io: &mut T) -> io::Result<Bytes>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut prefix = [0u8; PREFIX_LEN];
        io.read_exact(&mut prefix).await?;

        // Reject before allocating anything.
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame {
            return Err(FrameError::Oversize {
                len,
                limit: self.max_frame,
            }
            .into());
        }

        let mut frame = BytesMut::zeroed(len);
        io.read_exact(&mut frame).await?;
        Ok(frame.freeze())
    }

    async fn send_frame<T>(&self, io: &mut T, body: Bytes) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        if body.len() > self.max_frame {
            return Err(FrameError::Oversize {
                len: body.len(),
                limit: self.max_frame,
            }
            .into());
        }

        io.write_all(&(body.len() as u32).to_be_bytes()).await?;
        io.write_all(&body).await?;
        io.flush().await
    }
}

#[async_trait]
impl libp2p::request_response::Codec for Codec {
    type Protocol = StreamProtocol;

    type Request = RawRequest;
    type Response = RawResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        self.recv_frame(io).await.map(RawRequest)
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        self.recv_frame(io).await.map(RawResponse)
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        self.send_frame(io, req.0).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        self.send_frame(io, res.0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::futures::io::Cursor;

    #[tokio::test]
    async fn frame_round_trips() {
        let codec = Codec::new(1024);
        let mut stream = Cursor::new(Vec::new());

        codec
            .send_frame(&mut stream, Bytes::from_static(b"hello peer"))
            .await
            .unwrap();

        stream.set_position(0);
        let frame = codec.recv_frame(&mut stream).await.unwrap();
        assert_eq!(frame, Bytes::from_static(b"hello peer"));
    }

    #[tokio::test]
    async fn oversize_outbound_frame_is_refused() {
        let codec = Codec::new(8);
        let mut stream = Cursor::new(Vec::new());

        let err = codec
            .send_frame(&mut stream, Bytes::from_static(b"way past the limit"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // Nothing was written for the refused frame.
        assert!(stream.get_ref().is_empty());
    }

    #[tokio::test]
    async fn oversize_inbound_frame_is_refused_before_the_body() {
        let codec = Codec::new(8);

        // A peer promising a frame far over the limit.
        let mut stream = Cursor::new(1024u32.to_be_bytes().to_vec());

        let err = codec.recv_frame(&mut stream).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        let codec = Codec::new(1024);

        // Length prefix says 16 bytes, only 3 follow.
        let mut body = 16u32.to_be_bytes().to_vec();
        body.extend_from_slice(b"abc");
        let mut stream = Cursor::new(body);

        assert!(codec.recv_frame(&mut stream).await.is_err());
    }
}
