//! Streaming decoder for HTTP/1.1 response bodies.

use bytes::Bytes;
use n0_error::e;
use n0_future::{Stream, stream};
use tokio::io::AsyncRead;
use tracing::trace;

use crate::{
    error::GatewayError,
    parse::MAX_HEAD_LEN,
    util::{CRLF, Prebuffered, find_subsequence, resume_offset},
};

/// How a response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exactly this many bytes follow the head.
    Fixed(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Fixed { remaining: u64 },
    ChunkSize { scanned: usize },
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailer { scanned: usize },
    Done,
}

/// Pull-based body decoder over a stream whose response head was already consumed.
#[derive(Debug)]
pub struct BodyDecoder<S> {
    reader: Prebuffered<S>,
    state: State,
}

impl<S: AsyncRead + Unpin> BodyDecoder<S> {
    pub fn new(reader: Prebuffered<S>, framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Fixed(0) => State::Done,
            BodyFraming::Fixed(remaining) => State::Fixed { remaining },
            BodyFraming::Chunked => State::ChunkSize { scanned: 0 },
        };
        Self { reader, state }
    }

    /// Returns the next body chunk, or `None` once the body is complete.
    ///
    /// Never reads past the end of the body.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, GatewayError> {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::Fixed { remaining } => {
                    if self.reader.len() == 0 && self.reader.buffer_more().await? == 0 {
                        self.state = State::Done;
                        return Err(e!(GatewayError::TruncatedBody { missing: remaining }));
                    }
                    let n = (self.reader.len() as u64).min(remaining);
                    let chunk = self.reader.split_to(n as usize);
                    let remaining = remaining - n;
                    self.state = if remaining == 0 {
                        State::Done
                    } else {
                        State::Fixed { remaining }
                    };
                    return Ok(Some(chunk));
                }
                State::ChunkSize { scanned } => {
                    match find_subsequence(self.reader.buffer(), CRLF, scanned) {
                        Some(pos) => {
                            let size = parse_chunk_size(&self.reader.buffer()[..pos])?;
                            self.reader.discard(pos + CRLF.len());
                            trace!(size, "chunk");
                            self.state = if size == 0 {
                                State::Trailer { scanned: 0 }
                            } else {
                                State::ChunkData { remaining: size }
                            };
                        }
                        None => {
                            self.check_line_len("chunk size line")?;
                            self.state = State::ChunkSize {
                                scanned: resume_offset(self.reader.len(), CRLF.len()),
                            };
                            self.fill_chunked().await?;
                        }
                    }
                }
                State::ChunkData { remaining } => {
                    if self.reader.len() == 0 {
                        self.fill_chunked().await?;
                    }
                    let n = (self.reader.len() as u64).min(remaining);
                    let chunk = self.reader.split_to(n as usize);
                    let remaining = remaining - n;
                    self.state = if remaining == 0 {
                        State::ChunkEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                    return Ok(Some(chunk));
                }
                State::ChunkEnd => {
                    if self.reader.len() < CRLF.len() {
                        self.fill_chunked().await?;
                        continue;
                    }
                    if &self.reader.buffer()[..CRLF.len()] != CRLF {
                        self.state = State::Done;
                        return Err(GatewayError::malformed_response(
                            "chunk data is not followed by CRLF",
                        ));
                    }
                    self.reader.discard(CRLF.len());
                    self.state = State::ChunkSize { scanned: 0 };
                }
                State::Trailer { scanned } => {
                    match find_subsequence(self.reader.buffer(), CRLF, scanned) {
                        Some(0) => {
                            self.reader.discard(CRLF.len());
                            self.state = State::Done;
                            return Ok(None);
                        }
                        Some(pos) => {
                            self.reader.discard(pos + CRLF.len());
                            self.state = State::Trailer { scanned: 0 };
                        }
                        None => {
                            self.check_line_len("trailer line")?;
                            self.state = State::Trailer {
                                scanned: resume_offset(self.reader.len(), CRLF.len()),
                            };
                            self.fill_chunked().await?;
                        }
                    }
                }
            }
        }
    }

    /// Fails once an unterminated line grows past the head size limit.
    fn check_line_len(&mut self, what: &str) -> Result<(), GatewayError> {
        if self.reader.len() > MAX_HEAD_LEN {
            self.state = State::Done;
            return Err(GatewayError::malformed_response(format!(
                "{what} exceeds size limit"
            )));
        }
        Ok(())
    }

    async fn fill_chunked(&mut self) -> Result<(), GatewayError> {
        if self.reader.buffer_more().await? == 0 {
            self.state = State::Done;
            return Err(e!(GatewayError::TruncatedChunkedBody));
        }
        Ok(())
    }

    /// Converts the decoder into a stream of body chunks.
    ///
    /// The stream ends after the first error. The underlying stream is
    /// dropped as soon as the body is complete, fails, or the returned
    /// stream is dropped.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, GatewayError>> + Send + 'static
    where
        S: Send + 'static,
    {
        stream::unfold(Some(self), async |decoder| {
            let mut decoder = decoder?;
            match decoder.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(decoder))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, GatewayError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| GatewayError::malformed_response("chunk size line is not ascii"))?;
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| GatewayError::malformed_response(format!("invalid chunk size: {size:?}")))
}

#[cfg(test)]
mod tests {
    use n0_future::StreamExt;
    use n0_tracing_test::traced_test;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;

    /// Writes `data` one byte at a time and keeps the write side open until
    /// the returned sender is dropped.
    fn trickle(data: &'static [u8]) -> (DuplexStream, tokio::task::JoinHandle<DuplexStream>) {
        let (mut tx, rx) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            for byte in data {
                tx.write_all(&[*byte]).await.unwrap();
            }
            tx
        });
        (rx, writer)
    }

    /// Writes `prefix` and then `a` bytes until the reader goes away.
    async fn write_forever(mut tx: DuplexStream, prefix: &'static [u8]) -> std::io::Error {
        if let Err(err) = tx.write_all(prefix).await {
            return err;
        }
        let filler = vec![b'a'; 4096];
        loop {
            if let Err(err) = tx.write_all(&filler).await {
                return err;
            }
        }
    }

    async fn collect(
        decoder: BodyDecoder<DuplexStream>,
    ) -> Result<Vec<u8>, GatewayError> {
        let mut body = Vec::new();
        let mut stream = std::pin::pin!(decoder.into_stream());
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body)
    }

    #[tokio::test]
    #[traced_test]
    async fn fixed_length_single_byte_fragments() {
        let (rx, writer) = trickle(b"0123456789extra");
        let decoder = BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Fixed(10));
        let body = collect(decoder).await.unwrap();
        assert_eq!(body, b"0123456789");
        drop(writer);
    }

    #[tokio::test]
    async fn fixed_length_emits_prebuffered_bytes_first() {
        let (tx, rx) = tokio::io::duplex(16);
        drop(tx);
        let reader = Prebuffered::with_initial(rx, Bytes::from_static(b"abc"));
        let body = collect(BodyDecoder::new(reader, BodyFraming::Fixed(3)))
            .await
            .unwrap();
        assert_eq!(body, b"abc");
    }

    #[tokio::test]
    async fn fixed_length_truncated() {
        let (mut tx, rx) = tokio::io::duplex(16);
        tx.write_all(b"abc").await.unwrap();
        drop(tx);
        let err = collect(BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Fixed(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TruncatedBody { missing: 2, .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn chunked_ends_without_source_close() {
        let (rx, writer) = trickle(b"5\r\nhello\r\n0\r\n\r\n");
        let decoder = BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Chunked);
        let body = collect(decoder).await.unwrap();
        assert_eq!(body, b"hello");
        // the write half is still open here
        let _tx = writer.await.unwrap();
    }

    #[tokio::test]
    async fn chunked_with_extensions_and_trailers() {
        let (rx, writer) =
            trickle(b"3;name=value\r\nabc\r\nA\r\n0123456789\r\n0\r\nX-Trailer: yes\r\n\r\n");
        let decoder = BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Chunked);
        let body = collect(decoder).await.unwrap();
        assert_eq!(body, b"abc0123456789");
        let _tx = writer.await.unwrap();
    }

    #[tokio::test]
    async fn chunked_truncated_inside_chunk() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"a\r\nshort").await.unwrap();
        drop(tx);
        let err = collect(BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Chunked))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TruncatedChunkedBody { .. }));
    }

    #[tokio::test]
    async fn chunked_truncated_inside_trailer() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"1\r\nx\r\n0\r\nX-Trailer: y").await.unwrap();
        drop(tx);
        let err = collect(BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Chunked))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TruncatedChunkedBody { .. }));
    }

    #[tokio::test]
    async fn chunked_huge_size_streams_without_buffering() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"ffffffffffffffff\r\nabc").await.unwrap();
        drop(tx);
        let mut decoder = BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Chunked);
        assert_eq!(&decoder.next_chunk().await.unwrap().unwrap()[..], b"abc");
        let err = decoder.next_chunk().await.unwrap_err();
        assert!(matches!(err, GatewayError::TruncatedChunkedBody { .. }));
    }

    #[tokio::test]
    async fn chunked_size_overflowing_u64_is_malformed() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"10000000000000000\r\nabc").await.unwrap();
        let err = collect(BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Chunked))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedResponse { .. }));
        drop(tx);
    }

    #[tokio::test]
    async fn chunk_data_must_end_with_crlf() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"3\r\nabcXY0\r\n\r\n").await.unwrap();
        let mut decoder = BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Chunked);
        assert_eq!(&decoder.next_chunk().await.unwrap().unwrap()[..], b"abc");
        let err = decoder.next_chunk().await.unwrap_err();
        assert!(matches!(err, GatewayError::MalformedResponse { .. }));
        assert!(decoder.next_chunk().await.unwrap().is_none());
        drop(tx);
    }

    #[tokio::test]
    async fn unterminated_lines_are_capped() {
        for prefix in [&b""[..], b"0\r\n"] {
            let (tx, rx) = tokio::io::duplex(8 * 1024);
            let writer = tokio::spawn(write_forever(tx, prefix));
            let err = collect(BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Chunked))
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::MalformedResponse { .. }));
            // the decoder dropped the read half
            let err = writer.await.unwrap();
            assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
        }
    }

    #[tokio::test]
    async fn chunked_invalid_size() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"zz\r\n").await.unwrap();
        let err = collect(BodyDecoder::new(Prebuffered::new(rx), BodyFraming::Chunked))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedResponse { .. }));
    }
}
