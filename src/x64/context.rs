// This module fixes the canonical guest CPU context for x86-64. The layout is part of the
// engine's contract: trampolines, patch sequences and the comparison harness all address
// fields by byte offset, so every struct is repr(C) and the offsets are checked at compile
// time. GprState holds the sixteen integer registers in logical slot order followed by rip
// and eflags. FprState is exactly the 512-byte legacy FXSAVE image so that fxsave/fxrstor
// can target it directly. HostState is engine-private bookkeeping for the context switch:
// the saved host stack pointer, the resume selector, the pending callback and its origin,
// and a second FXSAVE area for the host floating point state.

//! Canonical CPU context layout.

use std::mem::{offset_of, size_of};

use iced_x86::Register;

/// Number of logical register slots (rax..r15, rbp, rsp, rip).
pub const NUM_GPR: usize = 17;
/// Slots usable as scratch registers (rax..rbp).
pub const AVAILABLE_GPR: usize = 15;

/// Logical slot -> architecture register.
pub const GPR_ID: [Register; NUM_GPR] = [
    Register::RAX,
    Register::RBX,
    Register::RCX,
    Register::RDX,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::RBP,
    Register::RSP,
    Register::RIP,
];

/// Marker stored in `HostState::callback` when no callback is pending.
pub const NO_CALLBACK: u64 = u64::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GprState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub eflags: u64,
}

impl GprState {
    /// Read a logical slot. `slot` is in `0..NUM_GPR`.
    pub fn get(&self, slot: usize) -> u64 {
        self.as_array()[slot]
    }

    pub fn set(&mut self, slot: usize, value: u64) {
        self.as_array_mut()[slot] = value;
    }

    fn as_array(&self) -> &[u64; 18] {
        // SAFETY: repr(C) struct of 18 u64 fields.
        unsafe { &*(self as *const Self as *const [u64; 18]) }
    }

    fn as_array_mut(&mut self) -> &mut [u64; 18] {
        // SAFETY: repr(C) struct of 18 u64 fields.
        unsafe { &mut *(self as *mut Self as *mut [u64; 18]) }
    }

    /// Field names in slot order, eflags last.
    pub const NAMES: [&'static str; 18] = [
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
        "r15", "rbp", "rsp", "rip", "eflags",
    ];
}

/// Legacy FXSAVE image (non REX.W form).
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FprState {
    pub fcw: u16,
    pub fsw: u16,
    pub ftw: u8,
    pub rsv1: u8,
    pub fop: u16,
    pub ip: u32,
    pub cs: u16,
    pub rsv2: u16,
    pub dp: u32,
    pub ds: u16,
    pub rsv3: u16,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st: [[u8; 16]; 8],
    pub xmm: [[u8; 16]; 16],
    pub reserved: [u8; 96],
}

impl FprState {
    /// x87 control word after `finit`.
    pub const DEFAULT_FCW: u16 = 0x37f;
    /// MXCSR with all exceptions masked, round to nearest.
    pub const DEFAULT_MXCSR: u32 = 0x1f80;
}

impl Default for FprState {
    fn default() -> Self {
        Self {
            fcw: Self::DEFAULT_FCW,
            fsw: 0,
            ftw: 0,
            rsv1: 0,
            fop: 0,
            ip: 0,
            cs: 0,
            rsv2: 0,
            dp: 0,
            ds: 0,
            rsv3: 0,
            mxcsr: Self::DEFAULT_MXCSR,
            mxcsr_mask: 0,
            st: [[0; 16]; 8],
            xmm: [[0; 16]; 16],
            reserved: [0; 96],
        }
    }
}

/// Engine-private part of the context.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostState {
    pub host_sp: u64,
    /// Address the prologue jumps to.
    pub selector: u64,
    pub callback: u64,
    /// Patch id of the pending callback.
    pub origin: u64,
    pub rsv1: u64,
    pub rsv2: u64,
    pub host_fpr: FprState,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            host_sp: 0,
            selector: 0,
            callback: NO_CALLBACK,
            origin: 0,
            rsv1: 0,
            rsv2: 0,
            host_fpr: FprState::default(),
        }
    }
}

#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub gpr_state: GprState,
    pub fpr_state: FprState,
    pub host_state: HostState,
}

pub const FPR_OFFSET: usize = offset_of!(Context, fpr_state);
pub const EFLAGS_OFFSET: usize = offset_of!(Context, gpr_state) + offset_of!(GprState, eflags);
pub const HOST_SP_OFFSET: usize = offset_of!(Context, host_state) + offset_of!(HostState, host_sp);
pub const SELECTOR_OFFSET: usize =
    offset_of!(Context, host_state) + offset_of!(HostState, selector);
pub const CALLBACK_OFFSET: usize =
    offset_of!(Context, host_state) + offset_of!(HostState, callback);
pub const ORIGIN_OFFSET: usize = offset_of!(Context, host_state) + offset_of!(HostState, origin);
pub const HOST_FPR_OFFSET: usize =
    offset_of!(Context, host_state) + offset_of!(HostState, host_fpr);

const _: () = assert!(size_of::<GprState>() == 18 * 8);
const _: () = assert!(size_of::<FprState>() == 512);
const _: () = assert!(offset_of!(FprState, fsw) == 2);
const _: () = assert!(offset_of!(FprState, ftw) == 4);
const _: () = assert!(offset_of!(FprState, fop) == 6);
const _: () = assert!(offset_of!(FprState, ip) == 8);
const _: () = assert!(offset_of!(FprState, cs) == 12);
const _: () = assert!(offset_of!(FprState, dp) == 16);
const _: () = assert!(offset_of!(FprState, ds) == 20);
const _: () = assert!(offset_of!(FprState, mxcsr) == 24);
const _: () = assert!(offset_of!(FprState, mxcsr_mask) == 28);
const _: () = assert!(offset_of!(FprState, st) == 32);
const _: () = assert!(offset_of!(FprState, xmm) == 160);
const _: () = assert!(offset_of!(FprState, reserved) == 416);
const _: () = assert!(offset_of!(Context, gpr_state) == 0);
const _: () = assert!(FPR_OFFSET == 144);
const _: () = assert!(FPR_OFFSET % 16 == 0);
const _: () = assert!(HOST_FPR_OFFSET % 16 == 0);
const _: () = assert!(size_of::<Context>() == 1216);
