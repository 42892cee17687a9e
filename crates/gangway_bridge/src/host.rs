use crate::codec;
use crate::error::{bridge_error, BridgeError, BridgeErrorKind, GuestThrow};
use crate::memory::GuestMemory;
use crate::slab::{Handle, HeapSlab, HostValue, SlabStats};
use anyhow::Result;
use wasmtime::{Caller, Extern, Linker, TypedFunc};

/// Per-store host state: the long-lived reference slab plus the call-local
/// value stack. Stack entries exist only for the duration of one `evaluate`
/// call and carry no slab bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct HostState {
    slab: HeapSlab,
    stack: Vec<HostValue>,
}

impl HostState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn slab_stats(&self) -> SlabStats {
        self.slab.stats()
    }

    /// Pushes a call argument and returns its stack-kind handle.
    pub(crate) fn push_arg(&mut self, value: HostValue) -> Handle {
        self.stack.push(value);
        Handle::stack(self.stack.len() - 1)
    }

    /// Discards all stack-kind values; called when the enclosing guest call
    /// returns, on every exit path.
    pub(crate) fn clear_stack(&mut self) {
        self.stack.clear();
    }

    pub(crate) fn insert(&mut self, value: HostValue) -> Handle {
        self.slab.insert(value)
    }

    pub(crate) fn value(&self, handle: Handle) -> Result<&HostValue, BridgeError> {
        if handle.is_stack() {
            self.stack.get(handle.index()).ok_or_else(|| {
                bridge_error(
                    BridgeErrorKind::GuestTrap,
                    format!("guest passed a stack handle {} with no live value", handle.as_raw()),
                )
            })
        } else {
            self.slab.get(handle.index())
        }
    }

    /// Stack handles are promoted: the value is copied into a fresh slab slot
    /// and a new slab handle returned. Slab handles just gain a reference.
    pub(crate) fn clone_ref(&mut self, handle: Handle) -> Result<Handle, BridgeError> {
        if handle.is_stack() {
            let value = self.value(handle)?.clone();
            Ok(self.slab.insert(value))
        } else {
            self.slab.retain(handle.index())?;
            Ok(handle)
        }
    }

    /// No-op for stack handles; they die with the call frame.
    pub(crate) fn drop_ref(&mut self, handle: Handle) -> Result<(), BridgeError> {
        if handle.is_stack() {
            return Ok(());
        }
        self.slab.release(handle.index())?;
        Ok(())
    }

    pub(crate) fn arg_handle(&self, index: usize) -> Result<Handle, BridgeError> {
        if index < self.stack.len() {
            Ok(Handle::stack(index))
        } else {
            Err(bridge_error(
                BridgeErrorKind::GuestTrap,
                format!("guest requested call argument {index}, but only {} exist", self.stack.len()),
            ))
        }
    }
}

/// Registers the host import surface under the `"host"` module. Accessors
/// follow the `*_new` / `*_get` pattern; `*_get` reports a type mismatch out
/// of band (flag byte or sentinel value) rather than trapping.
pub(crate) fn add_host_imports(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker
        .func_wrap("host", "object_clone_ref", |mut caller: Caller<'_, HostState>, raw: u32| -> Result<u32> {
            let handle = caller.data_mut().clone_ref(Handle::from_raw(raw))?;
            Ok(handle.as_raw())
        })
        .map_err(link_error)?;
    linker
        .func_wrap("host", "object_drop_ref", |mut caller: Caller<'_, HostState>, raw: u32| -> Result<()> {
            caller.data_mut().drop_ref(Handle::from_raw(raw))?;
            Ok(())
        })
        .map_err(link_error)?;
    linker
        .func_wrap(
            "host",
            "string_new",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> Result<u32> {
                let memory = exported_memory(&mut caller)?;
                let text = codec::read_string(memory, &caller, ptr, len)?;
                Ok(caller.data_mut().insert(HostValue::Str(text)).as_raw())
            },
        )
        .map_err(link_error)?;
    linker
        .func_wrap(
            "host",
            "string_get",
            |mut caller: Caller<'_, HostState>, raw: u32, len_ptr: u32| -> Result<u32> {
                let text = match caller.data().value(Handle::from_raw(raw))? {
                    HostValue::Str(text) => text.clone(),
                    _ => return Ok(0),
                };
                let memory = exported_memory(&mut caller)?;
                let alloc = exported_alloc(&mut caller)?;
                let len = codec::guest_len(&text)?;
                let ptr = alloc.call(&mut caller, len).map_err(|err| {
                    anyhow::Error::from(bridge_error(
                        BridgeErrorKind::GuestTrap,
                        format!("guest alloc trapped inside string_get: {err}"),
                    ))
                })?;
                if ptr == 0 {
                    return Err(anyhow::Error::from(bridge_error(
                        BridgeErrorKind::AllocationFailure,
                        format!("guest allocator returned null for {len} bytes"),
                    )));
                }
                memory.write_bytes(&mut caller, ptr, text.as_bytes())?;
                memory.write_u32(&mut caller, len_ptr, len)?;
                Ok(ptr)
            },
        )
        .map_err(link_error)?;
    linker
        .func_wrap("host", "number_new", |mut caller: Caller<'_, HostState>, value: f64| {
            caller.data_mut().insert(HostValue::Num(value)).as_raw()
        })
        .map_err(link_error)?;
    linker
        .func_wrap(
            "host",
            "number_get",
            |mut caller: Caller<'_, HostState>, raw: u32, invalid_ptr: u32| -> Result<f64> {
                let number = match caller.data().value(Handle::from_raw(raw))? {
                    HostValue::Num(value) => Some(*value),
                    _ => None,
                };
                match number {
                    Some(value) => Ok(value),
                    None => {
                        let memory = exported_memory(&mut caller)?;
                        memory.write_bytes(&mut caller, invalid_ptr, &[1])?;
                        Ok(0.0)
                    }
                }
            },
        )
        .map_err(link_error)?;
    linker
        .func_wrap("host", "boolean_new", |mut caller: Caller<'_, HostState>, value: u32| {
            caller.data_mut().insert(HostValue::Bool(value == 1)).as_raw()
        })
        .map_err(link_error)?;
    linker
        .func_wrap("host", "boolean_get", |caller: Caller<'_, HostState>, raw: u32| -> Result<u32> {
            // 0/1 for booleans, 2 for anything else.
            match caller.data().value(Handle::from_raw(raw))? {
                HostValue::Bool(true) => Ok(1u32),
                HostValue::Bool(false) => Ok(0u32),
                _ => Ok(2u32),
            }
        })
        .map_err(link_error)?;
    linker
        .func_wrap("host", "null_new", |mut caller: Caller<'_, HostState>| {
            caller.data_mut().insert(HostValue::Null).as_raw()
        })
        .map_err(link_error)?;
    linker
        .func_wrap("host", "is_null", |caller: Caller<'_, HostState>, raw: u32| -> Result<u32> {
            let is_null = matches!(caller.data().value(Handle::from_raw(raw))?, HostValue::Null);
            Ok(u32::from(is_null))
        })
        .map_err(link_error)?;
    linker
        .func_wrap("host", "absent_new", |mut caller: Caller<'_, HostState>| {
            caller.data_mut().insert(HostValue::Absent).as_raw()
        })
        .map_err(link_error)?;
    linker
        .func_wrap("host", "is_absent", |caller: Caller<'_, HostState>, raw: u32| -> Result<u32> {
            let is_absent =
                matches!(caller.data().value(Handle::from_raw(raw))?, HostValue::Absent);
            Ok(u32::from(is_absent))
        })
        .map_err(link_error)?;
    linker
        .func_wrap("host", "arg", |caller: Caller<'_, HostState>, index: u32| -> Result<u32> {
            Ok(caller.data().arg_handle(index as usize)?.as_raw())
        })
        .map_err(link_error)?;
    linker
        .func_wrap(
            "host",
            "throw",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> Result<()> {
                let memory = exported_memory(&mut caller)?;
                let message = codec::read_string(memory, &caller, ptr, len)?;
                Err(anyhow::Error::new(GuestThrow(message)))
            },
        )
        .map_err(link_error)?;
    Ok(())
}

fn exported_memory(caller: &mut Caller<'_, HostState>) -> Result<GuestMemory, BridgeError> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(GuestMemory::new(memory)),
        _ => Err(bridge_error(
            BridgeErrorKind::GuestTrap,
            "guest does not export its linear memory",
        )),
    }
}

fn exported_alloc(
    caller: &mut Caller<'_, HostState>,
) -> Result<TypedFunc<u32, u32>, BridgeError> {
    let func = match caller.get_export("alloc") {
        Some(Extern::Func(func)) => func,
        _ => {
            return Err(bridge_error(
                BridgeErrorKind::GuestTrap,
                "guest does not export an alloc function",
            ))
        }
    };
    func.typed::<u32, u32>(&*caller).map_err(|err| {
        bridge_error(
            BridgeErrorKind::GuestTrap,
            format!("guest alloc export has the wrong signature: {err}"),
        )
    })
}

fn link_error(err: wasmtime::Error) -> BridgeError {
    bridge_error(
        BridgeErrorKind::GuestUnavailable,
        format!("failed to register host import: {err}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_ref_promotes_stack_values_into_the_slab() {
        let mut state = HostState::new();
        let stack = state.push_arg(HostValue::Str("borrowed".to_string()));
        assert!(stack.is_stack());

        let promoted = state.clone_ref(stack).unwrap();
        assert!(!promoted.is_stack());
        assert_eq!(
            state.value(promoted).unwrap(),
            &HostValue::Str("borrowed".to_string())
        );

        // The promoted copy outlives the call frame.
        state.clear_stack();
        assert!(state.value(stack).is_err());
        assert!(state.value(promoted).is_ok());

        state.drop_ref(promoted).unwrap();
        assert_eq!(state.slab_stats().live, 0);
    }

    #[test]
    fn clone_ref_on_slab_handles_bumps_the_count_in_place() {
        let mut state = HostState::new();
        let handle = state.insert(HostValue::Num(42.0));
        let cloned = state.clone_ref(handle).unwrap();
        assert_eq!(cloned, handle);

        state.drop_ref(handle).unwrap();
        assert!(state.value(handle).is_ok());
        state.drop_ref(cloned).unwrap();
        assert!(state.value(handle).is_err());
    }

    #[test]
    fn drop_ref_ignores_stack_handles() {
        let mut state = HostState::new();
        let stack = state.push_arg(HostValue::Bool(true));
        state.drop_ref(stack).unwrap();
        assert_eq!(state.value(stack).unwrap(), &HostValue::Bool(true));
        assert_eq!(state.slab_stats().capacity, 0);
    }

    #[test]
    fn arg_handles_index_the_stack_in_push_order() {
        let mut state = HostState::new();
        state.push_arg(HostValue::Str("first".to_string()));
        state.push_arg(HostValue::Str("second".to_string()));
        let first = state.arg_handle(0).unwrap();
        let second = state.arg_handle(1).unwrap();
        assert_eq!(state.value(first).unwrap(), &HostValue::Str("first".to_string()));
        assert_eq!(state.value(second).unwrap(), &HostValue::Str("second".to_string()));
        assert!(state.arg_handle(2).is_err());
    }
}
