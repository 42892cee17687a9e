use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeErrorKind {
    /// The guest module failed to load, link, or instantiate.
    GuestUnavailable,
    /// The guest allocator could not satisfy a request.
    AllocationFailure,
    /// Text could not be represented under the boundary convention.
    EncodingFailure,
    /// The guest explicitly reported a failure through the `throw` import.
    GuestSignaled,
    /// The guest trapped or violated the boundary protocol.
    GuestTrap,
}

#[derive(Debug, Clone)]
pub struct BridgeError {
    pub kind: BridgeErrorKind,
    pub message: String,
}

pub(crate) fn bridge_error(kind: BridgeErrorKind, message: impl Into<String>) -> BridgeError {
    BridgeError {
        kind,
        message: message.into(),
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BridgeError {}

/// Payload of a guest-signaled failure, carried through wasmtime as the
/// cause of the trap so the adapter can recover it from the error chain.
#[derive(Debug)]
pub(crate) struct GuestThrow(pub(crate) String);

impl fmt::Display for GuestThrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guest signaled: {}", self.0)
    }
}

impl std::error::Error for GuestThrow {}

/// Maps an error escaping a guest call onto a bridge error. A `GuestThrow`
/// anywhere in the chain wins; otherwise the failure is a trap.
pub(crate) fn map_guest_error(err: anyhow::Error, default_message: &str) -> BridgeError {
    for cause in err.chain() {
        if let Some(thrown) = cause.downcast_ref::<GuestThrow>() {
            return bridge_error(BridgeErrorKind::GuestSignaled, thrown.0.clone());
        }
        if let Some(bridge) = cause.downcast_ref::<BridgeError>() {
            return bridge.clone();
        }
    }
    if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
        return bridge_error(
            BridgeErrorKind::GuestTrap,
            format!("{default_message}: {trap}"),
        );
    }
    bridge_error(
        BridgeErrorKind::GuestTrap,
        format!("{default_message}: {err}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_thrown_payload_from_chain() {
        let err = anyhow::Error::new(GuestThrow("unbalanced expression".to_string()))
            .context("wasm trap while calling eval");
        let mapped = map_guest_error(err, "guest evaluation failed");
        assert_eq!(mapped.kind, BridgeErrorKind::GuestSignaled);
        assert_eq!(mapped.message, "unbalanced expression");
    }

    #[test]
    fn recovers_bridge_error_from_chain() {
        let inner = bridge_error(BridgeErrorKind::AllocationFailure, "guest heap exhausted");
        let err = anyhow::Error::new(inner).context("call failed");
        let mapped = map_guest_error(err, "guest evaluation failed");
        assert_eq!(mapped.kind, BridgeErrorKind::AllocationFailure);
        assert_eq!(mapped.message, "guest heap exhausted");
    }

    #[test]
    fn falls_back_to_trap_kind() {
        let mapped = map_guest_error(anyhow::anyhow!("boom"), "guest evaluation failed");
        assert_eq!(mapped.kind, BridgeErrorKind::GuestTrap);
        assert_eq!(mapped.message, "guest evaluation failed: boom");
    }
}
