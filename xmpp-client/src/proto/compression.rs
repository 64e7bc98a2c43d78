// Copyright (c) 2025 The xmpp-client developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! zlib stream compression (XEP-0138).
//!
//! Every write is compressed with a sync flush so that the peer can decode
//! each stanza as soon as it arrives.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const READ_CHUNK: usize = 4096;

fn invalid_data<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Transparent zlib layer around a transport
pub struct ZlibStream<S> {
    inner: S,
    compress: Compress,
    decompress: Decompress,
    /// Compressed bytes not yet accepted by `inner`
    write_buf: Vec<u8>,
    write_pos: usize,
    /// Compressed bytes read from `inner` but not yet inflated
    read_buf: Vec<u8>,
    read_pos: usize,
    eof: bool,
}

impl<S> ZlibStream<S> {
    /// Wrap `inner`; both directions are compressed from the first byte on.
    pub fn new(inner: S) -> Self {
        ZlibStream {
            inner,
            compress: Compress::new(Compression::default(), true),
            decompress: Decompress::new(true),
            write_buf: Vec::new(),
            write_pos: 0,
            read_buf: Vec::new(),
            read_pos: 0,
            eof: false,
        }
    }

    /// Get a reference to the wrapped transport
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn deflate(&mut self, data: &[u8]) -> io::Result<()> {
        let mut consumed = 0;
        loop {
            self.write_buf.reserve(data.len() - consumed + 64);
            let before = self.compress.total_in();
            self.compress
                .compress_vec(&data[consumed..], &mut self.write_buf, FlushCompress::Sync)
                .map_err(invalid_data)?;
            consumed += (self.compress.total_in() - before) as usize;
            // Output space left over means the flush went through entirely.
            if consumed == data.len() && self.write_buf.len() < self.write_buf.capacity() {
                return Ok(());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> ZlibStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_buf.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.write_buf[self.write_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_pos += n;
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ZlibStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if this.read_pos < this.read_buf.len() {
                let before_in = this.decompress.total_in();
                let before_out = this.decompress.total_out();
                let out = buf.initialize_unfilled();
                this.decompress
                    .decompress(&this.read_buf[this.read_pos..], out, FlushDecompress::None)
                    .map_err(invalid_data)?;
                let consumed = (this.decompress.total_in() - before_in) as usize;
                let produced = (this.decompress.total_out() - before_out) as usize;
                this.read_pos += consumed;
                if this.read_pos == this.read_buf.len() {
                    this.read_buf.clear();
                    this.read_pos = 0;
                }
                if produced > 0 {
                    buf.advance(produced);
                    return Poll::Ready(Ok(()));
                }
                if consumed > 0 {
                    continue;
                }
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                this.eof = true;
                continue;
            }
            this.read_buf.drain(..this.read_pos);
            this.read_pos = 0;
            this.read_buf.extend_from_slice(chunk_buf.filled());
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ZlibStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        this.deflate(buf)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn writes_are_decodable_immediately() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut stream = ZlibStream::new(local);
        stream.write_all(b"<presence/>").await.unwrap();
        stream.flush().await.unwrap();

        let mut raw = vec![0u8; 4096];
        let n = remote.read(&mut raw).await.unwrap();
        let mut inflater = Decompress::new(true);
        let mut text = Vec::with_capacity(256);
        inflater
            .decompress_vec(&raw[..n], &mut text, FlushDecompress::Sync)
            .unwrap();
        assert_eq!(&text[..], b"<presence/>");
    }

    #[tokio::test]
    async fn reads_inflate_peer_data() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut deflater =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        deflater.write_all(b"<message><body>hi</body></message>").unwrap();
        deflater.flush().unwrap();
        let compressed = deflater.get_ref().clone();
        remote.write_all(&compressed).await.unwrap();

        let mut stream = ZlibStream::new(local);
        let mut out = vec![0u8; 64];
        let mut text = Vec::new();
        while text.len() < 34 {
            let n = stream.read(&mut out).await.unwrap();
            assert!(n > 0);
            text.extend_from_slice(&out[..n]);
        }
        assert_eq!(&text[..], b"<message><body>hi</body></message>");
    }

    #[tokio::test]
    async fn garbage_is_invalid_data() {
        let (local, mut remote) = tokio::io::duplex(64);
        remote.write_all(b"definitely not zlib").await.unwrap();
        let mut stream = ZlibStream::new(local);
        let mut out = [0u8; 16];
        let err = stream.read(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
