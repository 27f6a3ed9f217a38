//! RPC registration: the hook higher protocol layers ride on.
//!
//! A handler is bound to a short identifier. When a connected peer opens an
//! RPC stream naming that identifier, the handler receives the stream and
//! owns it until it returns. Payload framing is entirely the handler's
//! business; [`RpcStream::read_message`] and [`RpcStream::write_message`]
//! are offered for handlers happy with length-prefixed JSON.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use {
    async_trait::async_trait,
    nodegate_protocol::{FrameError, FrameStream, is_valid_rpc_id, read_frame, write_frame},
    serde::{Serialize, de::DeserializeOwned},
    tokio::{
        io::{AsyncRead, AsyncWrite, ReadBuf},
        net::TcpStream,
    },
};

use crate::{
    address::NetAddress,
    error::{Error, Result},
};

/// Serves or drives one RPC over an [`RpcStream`].
///
/// Implemented for any `Fn(RpcStream) -> impl Future<Output = anyhow::Result<()>>`.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, stream: RpcStream) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(RpcStream) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, stream: RpcStream) -> anyhow::Result<()> {
        (self)(stream).await
    }
}

/// Bidirectional byte stream of a single RPC.
///
/// Raw reads first drain whatever the handshake read ahead, so frame helpers
/// and raw I/O can be mixed freely.
#[derive(Debug)]
pub struct RpcStream {
    stream: FrameStream<TcpStream>,
    remote: NetAddress,
    id: String,
}

impl RpcStream {
    pub(crate) fn new(
        stream: FrameStream<TcpStream>,
        remote: NetAddress,
        id: impl Into<String>,
    ) -> Self {
        Self {
            stream,
            remote,
            id: id.into(),
        }
    }

    /// Address of the peer on the other end.
    pub fn remote(&self) -> &NetAddress {
        &self.remote
    }

    /// Identifier this stream was opened for.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn write_message<T: Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), FrameError> {
        write_frame(&mut self.stream, value).await
    }

    pub async fn read_message<T: DeserializeOwned>(
        &mut self,
    ) -> std::result::Result<T, FrameError> {
        read_frame(&mut self.stream).await
    }
}

impl AsyncRead for RpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let pending = self.stream.read_buffer_mut();
        if !pending.is_empty() {
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(self.stream.get_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for RpcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(self.stream.get_mut()).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.stream.get_mut()).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(self.stream.get_mut()).poll_shutdown(cx)
    }
}

/// Handlers keyed by RPC identifier.
#[derive(Default)]
pub(crate) struct RpcRegistry {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl RpcRegistry {
    pub fn register(&mut self, id: &str, handler: Arc<dyn RpcHandler>) -> Result<()> {
        if !is_valid_rpc_id(id) {
            return Err(Error::Validation(format!("invalid rpc id {id:?}")));
        }
        if self.handlers.contains_key(id) {
            return Err(Error::Validation(format!("rpc {id:?} is already registered")));
        }
        self.handlers.insert(id.to_string(), handler);
        Ok(())
    }

    pub fn unregister(&mut self, id: &str) -> bool {
        self.handlers.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(id).cloned()
    }

    /// Every registration as `(id, handler)` pairs.
    pub fn entries(&self) -> Vec<(String, Arc<dyn RpcHandler>)> {
        self.handlers
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn RpcHandler> {
        Arc::new(|_stream: RpcStream| async { Ok::<_, anyhow::Error>(()) })
    }

    #[test]
    fn register_validates_ids() {
        let mut registry = RpcRegistry::default();
        registry.register("SendBlocks", noop()).unwrap();
        assert!(matches!(
            registry.register("", noop()),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            registry.register("way too long rpc identifier", noop()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = RpcRegistry::default();
        registry.register("SendBlocks", noop()).unwrap();
        assert!(registry.register("SendBlocks", noop()).is_err());
        assert!(registry.unregister("SendBlocks"));
        registry.register("SendBlocks", noop()).unwrap();
    }

    #[test]
    fn ids_are_sorted() {
        let mut registry = RpcRegistry::default();
        registry.register("b", noop()).unwrap();
        registry.register("a", noop()).unwrap();
        assert_eq!(registry.ids(), ["a", "b"]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
        assert_eq!(registry.entries().len(), 2);
    }
}
