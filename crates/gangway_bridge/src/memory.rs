use crate::error::{bridge_error, BridgeError, BridgeErrorKind};
use wasmtime::{AsContext, AsContextMut, Memory};

/// View over the guest's linear memory. A guest call may grow (and thereby
/// reallocate) the backing buffer, so no slice is ever retained: every
/// accessor re-derives the byte view from the store, unconditionally.
#[derive(Clone, Copy)]
pub(crate) struct GuestMemory {
    memory: Memory,
}

impl GuestMemory {
    pub(crate) fn new(memory: Memory) -> Self {
        Self { memory }
    }

    pub(crate) fn size_bytes(&self, store: impl AsContext) -> usize {
        self.memory.data_size(store)
    }

    pub(crate) fn read_bytes(
        &self,
        store: impl AsContext,
        ptr: u32,
        len: u32,
    ) -> Result<Vec<u8>, BridgeError> {
        let data = self.memory.data(&store);
        let range = checked_range(ptr, len, data.len())?;
        Ok(data[range].to_vec())
    }

    pub(crate) fn write_bytes(
        &self,
        mut store: impl AsContextMut,
        ptr: u32,
        bytes: &[u8],
    ) -> Result<(), BridgeError> {
        let data = self.memory.data_mut(&mut store);
        let len = u32::try_from(bytes.len()).map_err(|_| {
            bridge_error(
                BridgeErrorKind::EncodingFailure,
                "write exceeds the guest-addressable range",
            )
        })?;
        let range = checked_range(ptr, len, data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Word-view read, little-endian.
    pub(crate) fn read_u32(&self, store: impl AsContext, addr: u32) -> Result<u32, BridgeError> {
        let bytes = self.read_bytes(store, addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Word-view write, little-endian.
    pub(crate) fn write_u32(
        &self,
        store: impl AsContextMut,
        addr: u32,
        value: u32,
    ) -> Result<(), BridgeError> {
        self.write_bytes(store, addr, &value.to_le_bytes())
    }

    /// Scans the byte view forward from `ptr` for a zero byte and returns the
    /// bytes strictly before it.
    #[allow(dead_code)]
    pub(crate) fn read_until_nul(
        &self,
        store: impl AsContext,
        ptr: u32,
    ) -> Result<Vec<u8>, BridgeError> {
        let data = self.memory.data(&store);
        let start = ptr as usize;
        if start > data.len() {
            return Err(out_of_bounds(ptr, 0, data.len()));
        }
        match data[start..].iter().position(|&b| b == 0) {
            Some(end) => Ok(data[start..start + end].to_vec()),
            None => Err(bridge_error(
                BridgeErrorKind::EncodingFailure,
                format!("no terminator found after offset {ptr}"),
            )),
        }
    }
}

fn checked_range(ptr: u32, len: u32, size: usize) -> Result<std::ops::Range<usize>, BridgeError> {
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| out_of_bounds(ptr, len, size))?;
    if end > size {
        return Err(out_of_bounds(ptr, len, size));
    }
    Ok(start..end)
}

fn out_of_bounds(ptr: u32, len: u32, size: usize) -> BridgeError {
    bridge_error(
        BridgeErrorKind::GuestTrap,
        format!("guest memory access out of bounds: ptr {ptr} len {len} size {size}"),
    )
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
    fn write_then_read_round_trips() {
        let (mut store, memory) = memory_fixture();
        memory.write_bytes(&mut store, 64, b"lambda").unwrap();
        let bytes = memory.read_bytes(&store, 64, 6).unwrap();
        assert_eq!(bytes, b"lambda");
    }

    #[test]
    fn word_view_is_little_endian() {
        let (mut store, memory) = memory_fixture();
        memory.write_u32(&mut store, 16, 0x0102_0304).unwrap();
        assert_eq!(memory.read_bytes(&store, 16, 4).unwrap(), [4, 3, 2, 1]);
        assert_eq!(memory.read_u32(&store, 16).unwrap(), 0x0102_0304);
    }

    #[test]
    fn rejects_out_of_bounds_reads() {
        let (store, memory) = memory_fixture();
        let size = memory.size_bytes(&store) as u32;
        let err = memory.read_bytes(&store, size - 2, 4).unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::GuestTrap);
        let err = memory.read_bytes(&store, u32::MAX, u32::MAX).unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::GuestTrap);
    }

    #[test]
    fn nul_scan_stops_before_terminator() {
        let (mut store, memory) = memory_fixture();
        memory.write_bytes(&mut store, 32, b"abc\0def").unwrap();
        assert_eq!(memory.read_until_nul(&store, 32).unwrap(), b"abc");
    }
}
