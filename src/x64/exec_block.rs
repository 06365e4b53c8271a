// This module manages exec blocks, the executable containers translated code runs from.
// Each block owns one mapping: a code area that starts with the context switch trampolines
// and then receives placed patch runs, and a data page that holds the block's copy of the
// guest context followed by the shadow slots. Placing a run validates every patch, hands
// each (patch, tag) pair its own slot, resolves the run at the current end of the code area
// and records per-patch metadata so callbacks can later be mapped back to the guest
// instruction and the memory access it captured. A block that runs out of code bytes or
// slots reports ExecBlockFull and the engine moves on to a fresh one.

//! Exec blocks: placement and execution of translated code.

use std::mem::size_of;

use crate::core::error::ExecError;
use crate::core::reloc::validate_patch;
use crate::core::types::{
    MEM_READ_ADDRESS_TAG, MEM_READ_VALUE_TAG, MEM_WRITE_ADDRESS_TAG, MEM_WRITE_VALUE_TAG,
};
use crate::instrument::{InstPosition, MemoryAccess, MemoryAccessFlags, MemoryAccessType};

use super::context::{Context, NO_CALLBACK};
use super::decoder::MemoryAccessInfo;
use super::encoder::{Placement, Resolver, SlotMap};
use super::memory::{ExecRegion, PAGE_SIZE};
use super::patch::Patch;
use super::trampoline::build_exec_trampolines;

/// Offset of the first shadow slot in the data page.
pub const SHADOW_BASE: usize = 1280;
/// Shadow slots per exec block.
pub const SHADOW_SLOTS: usize = (PAGE_SIZE - SHADOW_BASE) / 8;

const _: () = assert!(size_of::<Context>() <= SHADOW_BASE);

/// What the engine needs to know about a placed patch.
#[derive(Debug, Clone)]
pub struct PatchMeta {
    pub address: u64,
    pub size: u32,
    pub writes_pc: bool,
    pub slots: SlotMap,
    pub access: Option<MemoryAccessInfo>,
    pub recorded: MemoryAccessType,
}

impl PatchMeta {
    fn slot(&self, tag: u16) -> Option<usize> {
        self.slots.iter().find(|(t, _)| *t == tag).map(|&(_, s)| s)
    }
}

/// A callback requested by translated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCallback {
    pub id: u32,
    /// Id of the patch that exited.
    pub patch: usize,
}

#[derive(Debug)]
pub struct ExecBlock {
    region: ExecRegion,
    prologue: u64,
    epilogue: u64,
    code_used: usize,
    next_slot: usize,
    patches: Vec<PatchMeta>,
}

impl ExecBlock {
    pub fn new(code_pages: usize) -> Result<Self, ExecError> {
        let mut region = ExecRegion::new(code_pages)?;
        // SAFETY: the data page is page aligned, writable and larger than a Context.
        unsafe { region.data_ptr().cast::<Context>().write(Context::default()) };

        let trampolines = build_exec_trampolines(region.code_address(), region.data_address())?;
        region.write_code(0, &trampolines.code)?;
        region.make_code_executable()?;

        log::debug!(
            "exec block at {:#x}: prologue {:#x}, epilogue {:#x}",
            region.code_address(),
            trampolines.prologue,
            trampolines.epilogue
        );
        Ok(Self {
            prologue: trampolines.prologue,
            epilogue: trampolines.epilogue,
            code_used: align16(trampolines.code.len()),
            next_slot: 0,
            patches: Vec::new(),
            region,
        })
    }

    pub fn context_address(&self) -> u64 {
        self.region.data_address()
    }

    pub fn context(&self) -> &Context {
        // SAFETY: initialised in `new`; only translated code writes it, and
        // never while a reference is alive.
        unsafe { &*self.region.data_ptr().cast::<Context>() }
    }

    pub fn context_mut(&mut self) -> &mut Context {
        // SAFETY: as for `context`, with unique access through `&mut self`.
        unsafe { &mut *self.region.data_ptr().cast::<Context>() }
    }

    pub fn epilogue(&self) -> u64 {
        self.epilogue
    }

    pub fn code_remaining(&self) -> usize {
        self.region.code_size() - self.code_used
    }

    pub fn slots_remaining(&self) -> usize {
        SHADOW_SLOTS - self.next_slot
    }

    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    pub fn patch_meta(&self, id: usize) -> Option<&PatchMeta> {
        self.patches.get(id)
    }

    /// Place a run of patches; returns the code address of the first one.
    pub fn place(&mut self, patches: &[Patch<'_>]) -> Result<u64, ExecError> {
        for patch in patches {
            validate_patch(&patch.insts)?;
        }

        let mut next_slot = self.next_slot;
        let mut slots: Vec<SlotMap> = Vec::with_capacity(patches.len());
        for patch in patches {
            let map: SlotMap = patch
                .shadows
                .iter()
                .enumerate()
                .map(|(i, shadow)| (shadow.tag(), next_slot + i))
                .collect();
            next_slot += map.len();
            slots.push(map);
        }
        if next_slot > SHADOW_SLOTS {
            return Err(ExecError::ExecBlockFull);
        }

        let code_address = self.region.code_address() + self.code_used as u64;
        let placement = Placement {
            code_address,
            context_address: self.context_address(),
            shadow_base: self.context_address() + SHADOW_BASE as u64,
            epilogue_address: self.epilogue,
            first_patch_id: self.patches.len() as u64,
            slots: &slots,
        };
        let resolved = Resolver::new(placement).resolve(patches)?;
        if resolved.code.len() > self.code_remaining() {
            return Err(ExecError::ExecBlockFull);
        }

        self.region.make_code_writable()?;
        let written = self.region.write_code(self.code_used, &resolved.code);
        self.region.make_code_executable()?;
        written?;

        log::debug!(
            "placed {} patches ({} bytes, {} slots) at {:#x}",
            patches.len(),
            resolved.code.len(),
            next_slot - self.next_slot,
            code_address
        );
        self.code_used = align16(self.code_used + resolved.code.len());
        self.next_slot = next_slot;
        self.patches
            .extend(patches.iter().zip(slots).map(|(patch, slots)| PatchMeta {
                address: patch.address,
                size: patch.size,
                writes_pc: patch.writes_pc,
                slots,
                access: patch.access,
                recorded: patch.recorded,
            }));
        Ok(code_address + resolved.patch_offsets.first().copied().unwrap_or(0) as u64)
    }

    /// Run translated code from the selector until it exits.
    ///
    /// # Safety
    ///
    /// The selector must point at code placed in this block, and the guest
    /// code reachable from it must be safe to run in this process.
    pub unsafe fn execute(&mut self) {
        let entry: extern "sysv64" fn() = std::mem::transmute(self.prologue as usize as *const ());
        entry();
    }

    pub fn set_selector(&mut self, address: u64) {
        self.context_mut().host_state.selector = address;
    }

    pub fn selector(&self) -> u64 {
        self.context().host_state.selector
    }

    pub fn pending_callback(&self) -> Option<PendingCallback> {
        let host = &self.context().host_state;
        if host.callback == NO_CALLBACK {
            return None;
        }
        Some(PendingCallback {
            id: host.callback as u32,
            patch: host.origin as usize,
        })
    }

    pub fn clear_callback(&mut self) {
        self.context_mut().host_state.callback = NO_CALLBACK;
    }

    fn read_slot(&self, slot: usize) -> u64 {
        debug_assert!(slot < SHADOW_SLOTS);
        // SAFETY: slot indices are bounded by SHADOW_SLOTS, inside the data page.
        unsafe {
            self.region
                .data_ptr()
                .add(SHADOW_BASE + slot * 8)
                .cast::<u64>()
                .read()
        }
    }

    /// Value of shadow `tag` in patch `id`.
    pub fn shadow(&self, id: usize, tag: u16) -> Option<u64> {
        let slot = self.patches.get(id)?.slot(tag)?;
        Some(self.read_slot(slot))
    }

    /// Values of shadow `tag` in every patch of the instruction at `address`.
    pub fn shadows_at(&self, address: u64, tag: u16) -> impl Iterator<Item = u64> + '_ {
        self.patches
            .iter()
            .filter(move |m| m.address == address && m.size != 0)
            .filter_map(move |m| m.slot(tag))
            .map(|slot| self.read_slot(slot))
    }

    /// Accesses captured for patch `id` and visible at `position`.
    ///
    /// Reads are known before the instruction runs; writes only after.
    pub fn memory_accesses(&self, id: usize, position: InstPosition) -> Vec<MemoryAccess> {
        let Some(meta) = self.patches.get(id) else {
            return Vec::new();
        };
        let Some(access) = meta.access else {
            return Vec::new();
        };

        let flags = if access.value_size_supported() {
            MemoryAccessFlags::NONE
        } else {
            MemoryAccessFlags::UNKNOWN_VALUE
        };
        let value = |tag| {
            if access.value_size_supported() {
                meta.slot(tag).map_or(0, |s| self.read_slot(s))
            } else {
                0
            }
        };

        let mut out = Vec::new();
        if meta.recorded.contains(MemoryAccessType::READ) {
            if let Some(slot) = meta.slot(MEM_READ_ADDRESS_TAG) {
                out.push(MemoryAccess {
                    inst_address: meta.address,
                    access_address: self.read_slot(slot),
                    value: value(MEM_READ_VALUE_TAG),
                    size: access.size,
                    kind: MemoryAccessType::READ,
                    flags,
                });
            }
        }
        if position == InstPosition::PostInst && meta.recorded.contains(MemoryAccessType::WRITE) {
            if let Some(slot) = meta.slot(MEM_WRITE_ADDRESS_TAG) {
                out.push(MemoryAccess {
                    inst_address: meta.address,
                    access_address: self.read_slot(slot),
                    value: value(MEM_WRITE_VALUE_TAG),
                    size: access.size,
                    kind: MemoryAccessType::WRITE,
                    flags,
                });
            }
        }
        out
    }
}

fn align16(n: usize) -> usize {
    (n + 15) & !15
}
