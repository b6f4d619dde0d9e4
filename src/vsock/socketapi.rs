//! SocketAPI-style vsock dialing: connect to the host Unix socket that
//! multiplexes guest vsock ports, write an ASCII `CONNECT {port}\n`
//! handshake, then hand back the raw stream once the multiplexer replies
//! `OK\n` (§4.5).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::error::{VmError, VmResult};
use crate::vsock::{AsyncReadWrite, VsockDialer, VsockTarget};

pub struct UnixMultiplexerDialer {
    socket_path: PathBuf,
}

impl UnixMultiplexerDialer {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }
}

pub fn construct(target: VsockTarget) -> Arc<dyn VsockDialer> {
    match target {
        VsockTarget::UnixMultiplexer(socket_path) => Arc::new(UnixMultiplexerDialer::new(socket_path)),
        VsockTarget::AfVsock(_) => Arc::new(UnixMultiplexerDialer::new(PathBuf::new())),
    }
}

#[async_trait]
impl VsockDialer for UnixMultiplexerDialer {
    async fn connect(
        &self,
        ctx: &CancellationToken,
        port: u32,
    ) -> VmResult<Box<dyn AsyncReadWrite>> {
        if ctx.is_cancelled() {
            return Err(VmError::Cancelled);
        }

        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| VmError::Transport(format!("vsock multiplexer connect failed: {e}")))?;

        stream
            .write_all(format!("CONNECT {port}\n").as_bytes())
            .await
            .map_err(|e| VmError::Transport(format!("vsock handshake write failed: {e}")))?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader
            .read_line(&mut reply)
            .await
            .map_err(|e| VmError::Transport(format!("vsock handshake read failed: {e}")))?;

        if !reply.trim_end().starts_with("OK") {
            return Err(VmError::Transport(format!(
                "vsock multiplexer refused CONNECT {port}: {}",
                reply.trim_end()
            )));
        }

        Ok(Box::new(reader.into_inner()))
    }

    fn key(&self) -> String {
        self.socket_path.display().to_string()
    }
}
