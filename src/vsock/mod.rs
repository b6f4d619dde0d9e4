//! Host-to-guest vsock dialing (spec §4.5): one trait, two strategies.
//!
//! SocketAPI-style backends multiplex guest vsock ports over a host Unix
//! socket with a text handshake; CmdLine+Monitor-style backends expose the
//! guest directly over the kernel's native AF_VSOCK family. Guest-side
//! protocols built on top (e.g. an exec agent listening on a fixed port)
//! are written once against [`VsockDialer`] and never see the difference.

pub mod afvsock;
pub mod socketapi;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::VmResult;

/// Per-instance binding info a dialer constructor needs: which socket to
/// multiplex through, or which numeric cid to dial natively.
#[derive(Clone, Debug)]
pub enum VsockTarget {
    UnixMultiplexer(PathBuf),
    AfVsock(u32),
}

/// Marker trait for the bidirectional byte stream a dialer hands back,
/// erasing whether it came from a `UnixStream` or a `VsockStream`.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

#[async_trait]
pub trait VsockDialer: Send + Sync {
    /// Connect to `port` on the instance this dialer was constructed for.
    async fn connect(
        &self,
        ctx: &tokio_util::sync::CancellationToken,
        port: u32,
    ) -> VmResult<Box<dyn AsyncReadWrite>>;

    /// Identity used to key the process-global connection pool (§5).
    fn key(&self) -> String;
}
