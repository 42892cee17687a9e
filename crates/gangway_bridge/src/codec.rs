use crate::error::{bridge_error, BridgeError, BridgeErrorKind};
use crate::memory::GuestMemory;
use wasmtime::AsContext;

/// Byte length of `s` as the guest sees it. The boundary carries lengths as
/// 32-bit words, so anything larger is unrepresentable.
pub(crate) fn guest_len(s: &str) -> Result<u32, BridgeError> {
    u32::try_from(s.len()).map_err(|_| {
        bridge_error(
            BridgeErrorKind::EncodingFailure,
            format!("input of {} bytes exceeds the guest-addressable range", s.len()),
        )
    })
}

/// Explicit-length decode: reads exactly `len` bytes at `ptr`.
pub(crate) fn read_string(
    memory: GuestMemory,
    store: impl AsContext,
    ptr: u32,
    len: u32,
) -> Result<String, BridgeError> {
    decode_utf8(memory.read_bytes(store, ptr, len)?)
}

/// Sentinel-scan decode: reads up to (not including) the first zero byte.
///
/// Never used on the `evaluate` path, which carries explicit lengths; kept
/// because mixing the two conventions is the classic boundary defect and the
/// truncation it causes must stay observable. See the codec tests.
#[allow(dead_code)]
pub(crate) fn read_cstring(
    memory: GuestMemory,
    store: impl AsContext,
    ptr: u32,
) -> Result<String, BridgeError> {
    decode_utf8(memory.read_until_nul(store, ptr)?)
}

pub(crate) fn decode_utf8(bytes: Vec<u8>) -> Result<String, BridgeError> {
    String::from_utf8(bytes).map_err(|err| {
        bridge_error(
            BridgeErrorKind::EncodingFailure,
            format!("guest returned invalid UTF-8: {err}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, Instance, Module, Store};

    fn memory_fixture() -> (Store<()>, GuestMemory) {
        let engine = Engine::default();
        let module = Module::new(&engine, "(module (memory (export \"memory\") 1))").unwrap();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[]).unwrap();
        let memory = instance.get_memory(&mut store, "memory").unwrap();
        (store, GuestMemory::new(memory))
    }

    #[test]
    fn explicit_length_reads_multibyte_utf8() {
        let (mut store, memory) = memory_fixture();
        let text = "λx. x λ";
        memory.write_bytes(&mut store, 128, text.as_bytes()).unwrap();
        let len = guest_len(text).unwrap();
        assert_eq!(read_string(memory, &store, 128, len).unwrap(), text);
    }

    #[test]
    fn invalid_utf8_is_an_encoding_failure() {
        let (mut store, memory) = memory_fixture();
        memory.write_bytes(&mut store, 128, &[0xff, 0xfe]).unwrap();
        let err = read_string(memory, &store, 128, 2).unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::EncodingFailure);
    }

    #[test]
    fn mixing_conventions_truncates_at_embedded_zero() {
        let (mut store, memory) = memory_fixture();
        let bytes = b"ab\0cd";
        memory.write_bytes(&mut store, 64, bytes).unwrap();

        // The length-bearing read sees the whole buffer; the sentinel scan
        // stops at the embedded zero, silently dropping the tail.
        let full = read_string(memory, &store, 64, bytes.len() as u32).unwrap();
        assert_eq!(full, "ab\u{0}cd");
        let truncated = read_cstring(memory, &store, 64).unwrap();
        assert_eq!(truncated, "ab");
        assert_ne!(full, truncated);
    }
}
