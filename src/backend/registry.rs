//! Compile-time backend registration via `inventory`, matching the
//! engine-factory registry pattern used for hypervisor dispatch in the
//! reference runtime this crate grows from.
//!
//! Each backend implementation submits one [`BackendRegistration`] at link
//! time. The Orchestrator never matches on `HypervisorKind` itself — it
//! looks the kind up here, once, at construction time.

use std::sync::Arc;

use crate::backend::Backend;
use crate::error::VmError;
use crate::model::HypervisorKind;
use crate::vsock::{VsockDialer, VsockTarget};

pub type BackendFactoryFn = fn() -> Arc<dyn Backend>;
pub type DialerFactoryFn = fn(VsockTarget) -> Arc<dyn VsockDialer>;

/// One backend's complete registration: its kind plus constructors for its
/// `Backend` and `VsockDialer` implementations. The control socket filename
/// for a kind is owned by [`crate::path::backend_socket_filename`], not
/// duplicated here.
pub struct BackendRegistration {
    pub kind: HypervisorKind,
    pub backend_ctor: BackendFactoryFn,
    pub dialer_ctor: DialerFactoryFn,
}

inventory::collect!(BackendRegistration);

/// Construct the backend registered for `kind`.
pub fn create_backend(kind: HypervisorKind) -> VmResultBackend {
    for reg in inventory::iter::<BackendRegistration> {
        if reg.kind == kind {
            return Ok((reg.backend_ctor)());
        }
    }
    Err(VmError::Capability(format!(
        "no backend registered for {kind:?}"
    )))
}

/// Construct the vsock dialer registered for `kind`, bound to `target`.
pub fn create_vsock_dialer(kind: HypervisorKind, target: VsockTarget) -> VmResultDialer {
    for reg in inventory::iter::<BackendRegistration> {
        if reg.kind == kind {
            return Ok((reg.dialer_ctor)(target));
        }
    }
    Err(VmError::Capability(format!(
        "no vsock dialer registered for {kind:?}"
    )))
}

type VmResultBackend = Result<Arc<dyn Backend>, VmError>;
type VmResultDialer = Result<Arc<dyn VsockDialer>, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_backends_are_registered() {
        assert!(create_backend(HypervisorKind::SocketApi).is_ok());
        assert!(create_backend(HypervisorKind::CmdlineMonitor).is_ok());
    }

    #[test]
    fn both_dialers_are_registered() {
        assert!(create_vsock_dialer(
            HypervisorKind::SocketApi,
            VsockTarget::UnixMultiplexer("/tmp/test.sock".into())
        )
        .is_ok());
        assert!(create_vsock_dialer(HypervisorKind::CmdlineMonitor, VsockTarget::AfVsock(3)).is_ok());
    }
}
