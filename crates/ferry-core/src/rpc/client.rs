use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream, ToSocketAddrs,
    },
    sync::{oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
};

use super::frame::{decode_body, encode_body, read_frame, write_frame, RequestFrame, ResponseFrame};
use crate::error::TransportError;

/// Client half of a connection. Calls may be issued concurrently; replies are
/// paired with their request by sequence number.
pub struct RpcClient {
    peer: SocketAddr,
    writer: AsyncMutex<OwnedWriteHalf>,
    pending: Arc<Mutex<Pending>>,
    next_seq: AtomicU64,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Pending {
    calls: HashMap<u64, oneshot::Sender<ResponseFrame>>,
    closed: bool,
}

impl Pending {
    fn close(&mut self) {
        self.closed = true;
        // Dropping the senders fails every waiting call with ConnectionClosed.
        self.calls.clear();
    }
}

impl RpcClient {
    pub async fn connect<A>(addr: A) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransportError::Dial {
                addr: addr.to_string(),
                source,
            })?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader = tokio::spawn(read_replies(reader, pending.clone(), peer));
        tracing::debug!(%peer, "rpc client connected");
        Ok(Self {
            peer,
            writer: AsyncMutex::new(writer),
            pending,
            next_seq: AtomicU64::new(1),
            reader,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Issues `method` with an already encoded body and waits for the paired
    /// reply frame.
    pub async fn call_raw(&self, method: &str, body: Vec<u8>) -> Result<ResponseFrame, TransportError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(TransportError::ConnectionClosed);
            }
            pending.calls.insert(seq, tx);
        }

        let frame = RequestFrame {
            seq,
            method: method.to_string(),
            body,
        };
        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &frame).await
        };
        if let Err(err) = written {
            self.pending.lock().calls.remove(&seq);
            return Err(err);
        }

        rx.await.map_err(|_| TransportError::ConnectionClosed)
    }

    /// Typed call. A transport-level error reported by the server is returned
    /// as [`TransportError::ServerError`].
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, TransportError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let reply = self.call_raw(method, encode_body(args)?).await?;
        if let Some(message) = reply.error {
            return Err(TransportError::ServerError(message));
        }
        decode_body(&reply.body)
    }

    pub async fn close(&self) {
        self.pending.lock().close();
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            tracing::debug!(peer = %self.peer, error = %err, "rpc client shutdown");
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies(reader: OwnedReadHalf, pending: Arc<Mutex<Pending>>, peer: SocketAddr) {
    let mut reader = BufReader::new(reader);
    loop {
        match read_frame::<_, ResponseFrame>(&mut reader).await {
            Ok(Some(frame)) => {
                let waiter = pending.lock().calls.remove(&frame.seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => tracing::warn!(%peer, seq = frame.seq, "reply for unknown call"),
                }
            }
            Ok(None) => {
                tracing::debug!(%peer, "connection closed by peer");
                break;
            }
            Err(err) => {
                tracing::warn!(%peer, error = %err, "failed to read reply");
                break;
            }
        }
    }
    pending.lock().close();
}
