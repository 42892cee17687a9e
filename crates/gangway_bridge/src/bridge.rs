use crate::codec;
use crate::error::{bridge_error, map_guest_error, BridgeError, BridgeErrorKind};
use crate::host::{add_host_imports, HostState};
use crate::memory::GuestMemory;
use crate::slab::{HostValue, SlabStats};
use tracing::debug;
use wasmtime::{Engine, Instance, Linker, Module, Store, TypedFunc};

/// Counts of bridge-initiated guest heap operations. Every successful
/// allocation must be matched by exactly one deallocation, and every recorded
/// result pointer by one `free_result` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub allocations: u64,
    pub deallocations: u64,
    pub results_freed: u64,
}

/// A guest-heap region owed a release. Entries are pushed the moment a
/// region is acquired and drained on every exit path of the call.
enum Pending {
    Input { ptr: u32, size: u32 },
    Output { ptr: u32 },
}

/// Host side of the boundary: owns the store, the guest instance's exports,
/// and all process-wide bridge state. Constructed only by a successful
/// [`Bridge::load`], so holding a `Bridge` is the readiness signal.
pub struct Bridge {
    store: Store<HostState>,
    memory: GuestMemory,
    alloc: TypedFunc<u32, u32>,
    dealloc: TypedFunc<(u32, u32), ()>,
    eval: TypedFunc<u32, u32>,
    free_result: TypedFunc<u32, ()>,
    scratch_ptr_fn: TypedFunc<(), u32>,
    scratch: Option<u32>,
    stats: BridgeStats,
}

impl Bridge {
    /// Compiles, links, and instantiates the guest module, resolving its
    /// export surface. Any failure here is `GuestUnavailable`.
    pub fn load(wasm: impl AsRef<[u8]>) -> Result<Self, BridgeError> {
        let engine = Engine::default();
        let module = Module::new(&engine, wasm)
            .map_err(|err| unavailable(format!("guest module failed to compile: {err}")))?;
        let mut store = Store::new(&engine, HostState::new());
        let mut linker = Linker::new(&engine);
        add_host_imports(&mut linker)?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|err| unavailable(format!("guest module failed to instantiate: {err}")))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| unavailable("guest module does not export \"memory\""))?;
        let alloc = typed_export(&instance, &mut store, "alloc")?;
        let dealloc = typed_export(&instance, &mut store, "dealloc")?;
        let eval = typed_export(&instance, &mut store, "eval")?;
        let free_result = typed_export(&instance, &mut store, "free_result")?;
        let scratch_ptr_fn = typed_export(&instance, &mut store, "scratch_ptr")?;
        debug!(memory_bytes = memory.data_size(&store), "guest module loaded");
        Ok(Self {
            store,
            memory: GuestMemory::new(memory),
            alloc,
            dealloc,
            eval,
            free_result,
            scratch_ptr_fn,
            scratch: None,
            stats: BridgeStats::default(),
        })
    }

    /// Evaluates `source` inside the guest and returns the result text.
    ///
    /// Encode, invoke, decode, release, in strict sequence; `&mut self` rules
    /// out a second call starting before this one reaches idle. Whatever the
    /// outcome, every region acquired here is released and the call-argument
    /// stack is cleared before returning.
    pub fn evaluate(&mut self, source: &str) -> Result<String, BridgeError> {
        let mut pending = Vec::new();
        let result = self.evaluate_inner(source, &mut pending);
        let released = self.release_all(pending);
        self.store.data_mut().clear_stack();
        let text = result?;
        released?;
        Ok(text)
    }

    fn evaluate_inner(
        &mut self,
        source: &str,
        pending: &mut Vec<Pending>,
    ) -> Result<String, BridgeError> {
        let len = codec::guest_len(source)?;
        let input_ptr = self.allocate(len)?;
        pending.push(Pending::Input {
            ptr: input_ptr,
            size: len,
        });
        self.memory
            .write_bytes(&mut self.store, input_ptr, source.as_bytes())?;
        self.write_scratch(0, len)?;
        self.store
            .data_mut()
            .push_arg(HostValue::Str(source.to_string()));

        debug!(bytes = len, "invoking guest eval");
        let result_ptr = self
            .eval
            .call(&mut self.store, input_ptr)
            .map_err(|err| map_guest_error(err, "guest evaluation failed"))?;
        let result_len = self.read_scratch(0)?;
        pending.push(Pending::Output { ptr: result_ptr });

        let text = codec::read_string(self.memory, &self.store, result_ptr, result_len)?;
        debug!(bytes = result_len, "decoded guest result");
        Ok(text)
    }

    fn allocate(&mut self, size: u32) -> Result<u32, BridgeError> {
        let ptr = self
            .alloc
            .call(&mut self.store, size)
            .map_err(|err| map_guest_error(err, "guest alloc trapped"))?;
        if ptr == 0 {
            return Err(bridge_error(
                BridgeErrorKind::AllocationFailure,
                format!("guest allocator returned null for {size} bytes"),
            ));
        }
        self.stats.allocations += 1;
        Ok(ptr)
    }

    /// Drains the release list, deallocating every acquired region. Keeps
    /// draining past a trapping release; the first error is reported.
    fn release_all(&mut self, pending: Vec<Pending>) -> Result<(), BridgeError> {
        let mut first_error = None;
        for entry in pending {
            match entry {
                Pending::Input { ptr, size } => {
                    match self.dealloc.call(&mut self.store, (ptr, size)) {
                        Ok(()) => self.stats.deallocations += 1,
                        Err(err) => {
                            first_error
                                .get_or_insert(map_guest_error(err, "guest dealloc trapped"));
                        }
                    }
                }
                Pending::Output { ptr } => match self.free_result.call(&mut self.store, ptr) {
                    Ok(()) => self.stats.results_freed += 1,
                    Err(err) => {
                        first_error
                            .get_or_insert(map_guest_error(err, "guest free_result trapped"));
                    }
                },
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Address of the guest's scratch area, queried once and cached. Guest
    /// memory offsets are stable across grows, so the cache never goes stale.
    fn scratch_addr(&mut self) -> Result<u32, BridgeError> {
        if let Some(addr) = self.scratch {
            return Ok(addr);
        }
        let addr = self
            .scratch_ptr_fn
            .call(&mut self.store, ())
            .map_err(|err| map_guest_error(err, "guest scratch_ptr trapped"))?;
        self.scratch = Some(addr);
        Ok(addr)
    }

    fn write_scratch(&mut self, slot: u32, value: u32) -> Result<(), BridgeError> {
        let addr = self.scratch_addr()?;
        self.memory
            .write_u32(&mut self.store, addr + slot * 4, value)
    }

    fn read_scratch(&mut self, slot: u32) -> Result<u32, BridgeError> {
        let addr = self.scratch_addr()?;
        self.memory.read_u32(&self.store, addr + slot * 4)
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn slab_stats(&self) -> SlabStats {
        self.store.data().slab_stats()
    }

    /// Current guest memory size in bytes; reflects grows as soon as they
    /// happen because the view is re-derived on every access.
    pub fn memory_size(&self) -> usize {
        self.memory.size_bytes(&self.store)
    }
}

fn typed_export<Params, Results>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<TypedFunc<Params, Results>, BridgeError>
where
    Params: wasmtime::WasmParams,
    Results: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<Params, Results>(&mut *store, name)
        .map_err(|err| {
            unavailable(format!(
                "guest export \"{name}\" is missing or mistyped: {err}"
            ))
        })
}

fn unavailable(message: impl Into<String>) -> BridgeError {
    bridge_error(BridgeErrorKind::GuestUnavailable, message)
}
