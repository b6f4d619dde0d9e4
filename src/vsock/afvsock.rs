//! AF_VSOCK-style vsock dialing: connect directly to (cid, port) using the
//! kernel's native vsock transport, no multiplexer process involved (§4.5).
//! Grounded on the corpus's own guest-side agent, which dials the host cid
//! the same way `tokio_vsock` exposes it — here adapted host-to-guest,
//! against the instance's own derived `vsock_cid` rather than
//! `VMADDR_CID_HOST`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_vsock::{VsockAddr, VsockStream};

use crate::error::{VmError, VmResult};
use crate::vsock::{AsyncReadWrite, VsockDialer, VsockTarget};

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

pub struct AfVsockDialer {
    cid: u32,
}

impl AfVsockDialer {
    pub fn new(cid: u32) -> Self {
        Self { cid }
    }
}

pub fn construct(target: VsockTarget) -> Arc<dyn VsockDialer> {
    match target {
        VsockTarget::AfVsock(cid) => Arc::new(AfVsockDialer::new(cid)),
        VsockTarget::UnixMultiplexer(_) => Arc::new(AfVsockDialer::new(0)),
    }
}

#[async_trait]
impl VsockDialer for AfVsockDialer {
    async fn connect(
        &self,
        ctx: &CancellationToken,
        port: u32,
    ) -> VmResult<Box<dyn AsyncReadWrite>> {
        let addr = VsockAddr::new(self.cid, port);

        tokio::select! {
            _ = ctx.cancelled() => Err(VmError::Cancelled),
            result = tokio::time::timeout(CONNECT_DEADLINE, VsockStream::connect(addr)) => {
                match result {
                    Ok(Ok(stream)) => Ok(Box::new(stream) as Box<dyn AsyncReadWrite>),
                    Ok(Err(e)) => Err(VmError::Transport(format!(
                        "af_vsock connect to cid={} port={port} failed: {e}",
                        self.cid
                    ))),
                    Err(_) => Err(VmError::Timeout {
                        operation: format!("af_vsock connect to cid={} port={port}", self.cid),
                    }),
                }
            }
        }
    }

    fn key(&self) -> String {
        format!("vsock:{}", self.cid)
    }
}
