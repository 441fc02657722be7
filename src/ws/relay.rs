use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_tungstenite::tungstenite::{
    self, Message, Utf8Bytes,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::{debug, trace, warn};

use super::codec::{FrameReader, OpCode, encode_frame};
use crate::{error::GatewayError, util::Prebuffered};

/// Relays messages between an accepted client WebSocket and a stream that
/// completed the client handshake.
///
/// Runs until either side closes, then closes the other side.
pub async fn relay<C, S>(client: C, socket: Prebuffered<S>) -> Result<(), GatewayError>
where
    C: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin
        + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (buffered, socket) = socket.into_parts();
    let (socket_rx, mut socket_tx) = tokio::io::split(socket);
    let mut frames = FrameReader::new(Prebuffered::with_initial(socket_rx, buffered));
    // pongs are written by the client-to-socket loop, which owns the write half
    let (pong_tx, mut pong_rx) = mpsc::channel::<bytes::Bytes>(4);

    let client_to_socket = async move {
        loop {
            let frame = tokio::select! {
                message = client_rx.next() => {
                    let Some(message) = message else { break };
                    match message.map_err(std::io::Error::other)? {
                        Message::Text(text) => encode_frame(OpCode::Text, text.as_bytes())?,
                        Message::Binary(data) => encode_frame(OpCode::Binary, &data)?,
                        Message::Close(_) => break,
                        _ => continue,
                    }
                }
                Some(payload) = pong_rx.recv() => encode_frame(OpCode::Pong, &payload)?,
            };
            socket_tx.write_all(&frame).await?;
        }
        debug!("client closed, shutting down destination socket");
        socket_tx.shutdown().await.ok();
        Ok::<_, GatewayError>(())
    };

    let socket_to_client = async move {
        let res = loop {
            let frame = match frames.next_message().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            let message = match frame.opcode {
                OpCode::Text => match String::from_utf8(frame.payload.to_vec()) {
                    Ok(text) => Message::text(text),
                    Err(_) => Message::binary(frame.payload),
                },
                OpCode::Binary => Message::binary(frame.payload),
                OpCode::Close => {
                    debug!("destination sent close");
                    break Ok(());
                }
                OpCode::Ping => {
                    pong_tx.send(frame.payload).await.ok();
                    continue;
                }
                OpCode::Pong => continue,
                opcode => {
                    trace!(%opcode, "ignoring frame");
                    continue;
                }
            };
            if let Err(err) = client_tx.send(message).await {
                break Err(std::io::Error::other(err).into());
            }
        };
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static(""),
        }));
        client_tx.send(close).await.ok();
        client_tx.close().await.ok();
        res
    };

    let res = tokio::select! {
        res = client_to_socket => res,
        res = socket_to_client => res,
    };
    if let Err(err) = &res {
        warn!("websocket relay failed: {err:#}");
    }
    res
}
