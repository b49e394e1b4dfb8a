use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;

use super::{BoxedStream, ClientImpl, DialArgs};
use crate::early_data;
use crate::ws::ClientWsStream;

/// Adapts a WS frame stream to plain `AsyncRead`/`AsyncWrite` so the rest of
/// the tunnel (the copy engine, the other `ClientImpl`s) never has to know
/// frames exist. Binary frames become byte runs; the tunnel protocol itself
/// carries no other message semantics, so text/ping/pong/close are handled
/// here and not surfaced upward.
pub struct WsByteStream {
    inner: ClientWsStream,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl WsByteStream {
    pub fn new(inner: ClientWsStream) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.read_pos < self.read_buf.len() {
                let available = &self.read_buf[self.read_pos..];
                let n = available.len().min(out.remaining());
                out.put_slice(&available[..n]);
                self.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buf = data;
                    self.read_pos = 0;
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(_))) => continue, // ping/pong/text: not tunnel payload
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)))
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            Poll::Pending => return Poll::Pending,
        }
        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

pub struct WsClientImpl {
    ws_url: String,
    headers: HashMap<String, String>,
    early_data_len: usize,
}

/// Strip the `ed=N` query parameter from a WS URL and return the cleaned URL
/// plus the early-data byte count it carried, per the `?ed=N` contract:
/// "read up to N bytes from the inbound socket before dialing and carry them
/// as base64url early-data".
fn split_early_data_param(ws_url: &str) -> (String, usize) {
    let Some((base, query)) = ws_url.split_once('?') else {
        return (ws_url.to_string(), 0);
    };
    let mut ed_len = 0usize;
    let mut kept = Vec::new();
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("ed=") {
            ed_len = value.parse().unwrap_or(0);
        } else if !pair.is_empty() {
            kept.push(pair);
        }
    }
    if kept.is_empty() {
        (base.to_string(), ed_len)
    } else {
        (format!("{base}?{}", kept.join("&")), ed_len)
    }
}

impl WsClientImpl {
    pub fn new(ws_url: String, headers: HashMap<String, String>) -> Self {
        let (ws_url, early_data_len) = split_early_data_param(&ws_url);
        Self { ws_url, headers, early_data_len }
    }
}

#[async_trait]
impl ClientImpl for WsClientImpl {
    async fn dial(&self, args: DialArgs) -> io::Result<BoxedStream> {
        let early_data_protocol = if args.early_data.is_empty() {
            None
        } else {
            Some(early_data::encode(&args.early_data))
        };
        let stream = crate::ws::dial(&self.ws_url, &self.headers, early_data_protocol.as_deref())
            .await?;
        Ok(Box::pin(WsByteStream::new(stream)))
    }

    fn target(&self) -> &str {
        &self.ws_url
    }

    fn proxy(&self) -> &str {
        ""
    }

    fn early_data_len(&self) -> usize {
        self.early_data_len
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;

    #[test]
    fn strips_ed_param_and_reports_length() {
        let client = WsClientImpl::new("ws://127.0.0.1:8443/tun?ed=2048".to_string(), HashMap::new());
        assert_eq!(client.target(), "ws://127.0.0.1:8443/tun");
        assert_eq!(client.early_data_len(), 2048);
    }

    #[test]
    fn leaves_plain_url_untouched() {
        let client = WsClientImpl::new("ws://127.0.0.1:8443/tun".to_string(), HashMap::new());
        assert_eq!(client.target(), "ws://127.0.0.1:8443/tun");
        assert_eq!(client.early_data_len(), 0);
    }
}
