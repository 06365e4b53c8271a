//! Native execution of calls that leave the instrumented ranges.
//!
//! When guest code calls a function outside every instrumented range, the
//! engine does not translate it. The broker pops the guest return address,
//! calls the target natively through a context-switch gate (which pushes the
//! gate's own return address in the same stack slot) and hands control back
//! to the engine at the original return address once the callee returns.

use crate::core::error::ExecError;

use super::context::Context;
use super::memory::ExecRegion;
use super::trampoline::build_broker_gate;

#[derive(Debug)]
pub struct ExecBroker {
    region: ExecRegion,
    entry: u64,
    return_address: u64,
}

impl ExecBroker {
    pub fn new() -> Result<Self, ExecError> {
        let mut region = ExecRegion::new(1)?;
        // SAFETY: the data page is page aligned, writable and larger than a Context.
        unsafe { region.data_ptr().cast::<Context>().write(Context::default()) };

        let gate = build_broker_gate(region.code_address(), region.data_address())?;
        region.write_code(0, &gate.code)?;
        region.make_code_executable()?;
        log::debug!(
            "exec broker at {:#x}, native code returns to {:#x}",
            region.code_address(),
            gate.return_address
        );
        Ok(Self {
            entry: region.code_address(),
            return_address: gate.return_address,
            region,
        })
    }

    /// Where brokered native code returns to.
    pub fn return_address(&self) -> u64 {
        self.return_address
    }

    fn context_mut(&mut self) -> &mut Context {
        // SAFETY: the data page holds the Context written in `new`.
        unsafe { &mut *self.region.data_ptr().cast::<Context>() }
    }

    /// Guest return address at the top of the stack of `context`.
    ///
    /// # Safety
    ///
    /// The guest rsp must point at readable memory.
    pub unsafe fn pending_return(context: &Context) -> u64 {
        (context.gpr_state.rsp as *const u64).read_unaligned()
    }

    /// Run the native function at `target` as if called by the guest.
    ///
    /// The guest stack must hold the caller's return address at rsp. On
    /// return, `context` holds the state after the callee returned, with rip
    /// set to that return address.
    ///
    /// # Safety
    ///
    /// `target` must be native code that follows the call/ret discipline, and
    /// the guest stack must be readable and writable.
    pub unsafe fn call(&mut self, context: &mut Context, target: u64) -> u64 {
        let resume = Self::pending_return(context);
        {
            let data = self.context_mut();
            data.gpr_state = context.gpr_state;
            data.gpr_state.rsp += 8;
            data.fpr_state = context.fpr_state;
            data.host_state.selector = target;
        }
        log::trace!("brokering native call to {target:#x}, resuming at {resume:#x}");

        let gate: extern "sysv64" fn() = std::mem::transmute(self.entry as usize as *const ());
        gate();

        let data = self.context_mut();
        context.gpr_state = data.gpr_state;
        context.fpr_state = data.fpr_state;
        context.gpr_state.rip = resume;
        resume
    }
}

#[cfg(all(test, target_arch = "x86_64", target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_native_call_returns_to_guest() {
        // lea rax, [rdi + rsi]; ret
        let mut callee = ExecRegion::new(1).unwrap();
        callee.write_code(0, &[0x48, 0x8d, 0x04, 0x37, 0xc3]).unwrap();
        callee.make_code_executable().unwrap();

        let mut stack = vec![0u64; 512];
        let top = stack.as_mut_ptr() as u64 + 256 * 8;
        stack[256] = 0xdead_0000;

        let mut ctx = Context::default();
        ctx.gpr_state.rsp = top;
        ctx.gpr_state.rdi = 40;
        ctx.gpr_state.rsi = 2;
        ctx.gpr_state.rbx = 7;
        ctx.gpr_state.eflags = 0x202;

        let mut broker = ExecBroker::new().unwrap();
        let resume = unsafe { broker.call(&mut ctx, callee.code_address()) };

        assert_eq!(resume, 0xdead_0000);
        assert_eq!(ctx.gpr_state.rip, 0xdead_0000);
        assert_eq!(ctx.gpr_state.rax, 42);
        assert_eq!(ctx.gpr_state.rbx, 7);
        assert_eq!(ctx.gpr_state.rsp, top + 8);
        // the gate reused the caller's return slot
        assert_eq!(stack[256], broker.return_address());
    }
}
