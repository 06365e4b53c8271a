// This module ties translation and execution together. The Engine owns the guest context,
// the instrumented ranges, the registered rules and callbacks, and a list of exec blocks with
// a cache from guest start address to placed entry point. Running looks up (or translates)
// the basic block at the current pc, copies the guest registers into the block's context,
// enters through the prologue and copies them back once the code leaves through the
// epilogue. If the exit was a callback request, the matching closure runs against the guest
// state and its HookAction decides whether execution resumes right after the hook, stops,
// or continues at a new pc. Translation decodes straight from guest memory, builds one patch
// per instruction plus the block-exit patch inside a per-translation arena, and places the
// whole run at once; a full exec block is replaced by a fresh one. A call that lands outside
// every instrumented range is handed to the exec broker, which runs the callee natively and
// resumes translation at the guest return address.

//! The instrumentation engine.

use std::ops::Range;

use bumpalo::Bump;
use hashbrown::HashMap;
use iced_x86::Mnemonic;

use crate::config::EngineOptions;
use crate::core::error::{ExecError, ExecResult};
use crate::core::session::{SessionStats, TranslationSession};
use crate::instrument::{
    Callback, CallbackRule, HookAction, InstFilter, InstPosition, InstrRule, MemoryAccessType,
    VmState,
};
use crate::x64::broker::ExecBroker;
use crate::x64::context::{Context, FprState, GprState};
use crate::x64::decoder::{decode, MAX_INST_LEN};
use crate::x64::exec_block::{ExecBlock, PendingCallback};
use crate::x64::patch::{GeneratorConfig, PatchGenerator};

#[derive(Debug, Clone, Copy)]
struct CachedBlock {
    block: usize,
    entry: u64,
    /// Guest address after the last translated instruction.
    end: u64,
}

impl CachedBlock {
    /// Whether the block starting at `pc` would execute `stop` before exiting.
    fn runs_past(&self, pc: u64, stop: u64) -> bool {
        pc < stop && stop < self.end
    }
}

/// Dynamic binary instrumentation engine for x86-64 guest code.
pub struct Engine {
    options: EngineOptions,
    ranges: Vec<Range<u64>>,
    blocks: Vec<ExecBlock>,
    cache: HashMap<u64, CachedBlock>,
    rules: Vec<(u32, Box<dyn InstrRule>)>,
    callbacks: HashMap<u32, (InstPosition, Callback)>,
    next_id: u32,
    record: MemoryAccessType,
    context: Box<Context>,
    broker: Option<ExecBroker>,
    stats: SessionStats,
    arena: Bump,
}

impl Engine {
    pub fn new(options: EngineOptions) -> ExecResult<Self> {
        options.validate()?;
        Ok(Self {
            options,
            ranges: Vec::new(),
            blocks: Vec::new(),
            cache: HashMap::new(),
            rules: Vec::new(),
            callbacks: HashMap::new(),
            next_id: 0,
            record: MemoryAccessType::NONE,
            context: Box::default(),
            broker: None,
            stats: SessionStats::default(),
            arena: Bump::new(),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn set_context(&mut self, context: &Context) {
        self.context.gpr_state = context.gpr_state;
        self.context.fpr_state = context.fpr_state;
    }

    pub fn gpr_state(&mut self) -> &mut GprState {
        &mut self.context.gpr_state
    }

    pub fn fpr_state(&mut self) -> &mut FprState {
        &mut self.context.fpr_state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Allow translation of guest code in `range`.
    ///
    /// # Safety
    ///
    /// Every byte in `range` must stay readable for as long as the engine may
    /// translate from it.
    pub unsafe fn add_instrumented_range(&mut self, range: Range<u64>) {
        log::debug!("instrumenting {:#x}..{:#x}", range.start, range.end);
        self.ranges.push(range);
    }

    pub fn remove_instrumented_ranges(&mut self) {
        self.ranges.clear();
        self.clear_cache();
    }

    pub fn is_instrumented(&self, address: u64) -> bool {
        range_end(&self.ranges, address).is_some()
    }

    /// Drop every translated block.
    pub fn clear_cache(&mut self) {
        if !self.cache.is_empty() || !self.blocks.is_empty() {
            log::debug!(
                "clearing {} cached blocks in {} exec blocks",
                self.cache.len(),
                self.blocks.len()
            );
        }
        self.cache.clear();
        self.blocks.clear();
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a custom rule; returns its id.
    pub fn add_instr_rule(&mut self, rule: Box<dyn InstrRule>) -> u32 {
        let id = self.alloc_id();
        self.rules.push((id, rule));
        self.clear_cache();
        id
    }

    fn add_callback(&mut self, filter: InstFilter, position: InstPosition, callback: Callback) -> u32 {
        let id = self.alloc_id();
        self.rules.push((
            id,
            Box::new(CallbackRule {
                id,
                position,
                filter,
            }),
        ));
        self.callbacks.insert(id, (position, callback));
        self.clear_cache();
        id
    }

    /// Call `callback` at `position` of every instruction.
    pub fn add_code_cb<F>(&mut self, position: InstPosition, callback: F) -> u32
    where
        F: FnMut(&mut VmState<'_>) -> HookAction + 'static,
    {
        self.add_callback(InstFilter::All, position, Box::new(callback))
    }

    /// Call `callback` at `position` of the instruction at `address`.
    pub fn add_code_addr_cb<F>(&mut self, address: u64, position: InstPosition, callback: F) -> u32
    where
        F: FnMut(&mut VmState<'_>) -> HookAction + 'static,
    {
        self.add_callback(InstFilter::Address(address), position, Box::new(callback))
    }

    pub fn add_code_range_cb<F>(&mut self, range: Range<u64>, position: InstPosition, callback: F) -> u32
    where
        F: FnMut(&mut VmState<'_>) -> HookAction + 'static,
    {
        self.add_callback(InstFilter::Range(range), position, Box::new(callback))
    }

    pub fn add_mnemonic_cb<F>(&mut self, mnemonic: Mnemonic, position: InstPosition, callback: F) -> u32
    where
        F: FnMut(&mut VmState<'_>) -> HookAction + 'static,
    {
        self.add_callback(InstFilter::Mnemonic(mnemonic), position, Box::new(callback))
    }

    /// Record accesses of `kind` and call `callback` after every instruction
    /// whose explicit memory operand matches.
    pub fn add_mem_access_cb<F>(&mut self, kind: MemoryAccessType, callback: F) -> u32
    where
        F: FnMut(&mut VmState<'_>) -> HookAction + 'static,
    {
        self.record = self.record | kind;
        self.add_callback(
            InstFilter::MemoryAccess(kind),
            InstPosition::PostInst,
            Box::new(callback),
        )
    }

    /// Capture accesses of `kind` for every instruction, so callbacks see them.
    pub fn record_memory_access(&mut self, kind: MemoryAccessType) {
        let record = self.record | kind;
        if record != self.record {
            self.record = record;
            self.clear_cache();
        }
    }

    /// Remove the rule or callback `id`. Returns false for unknown ids.
    pub fn remove_instrumentation(&mut self, id: u32) -> bool {
        let before = self.rules.len();
        self.rules.retain(|(rule, _)| *rule != id);
        self.callbacks.remove(&id);
        let removed = self.rules.len() != before;
        if removed {
            self.clear_cache();
        }
        removed
    }

    pub fn remove_all_instrumentation(&mut self) {
        self.rules.clear();
        self.callbacks.clear();
        self.record = MemoryAccessType::NONE;
        self.clear_cache();
    }

    /// Sum of shadow `tag` over every translated copy of the instruction at `address`.
    pub fn shadow_value(&self, address: u64, tag: u16) -> Option<u64> {
        let mut values = self
            .blocks
            .iter()
            .flat_map(|b| b.shadows_at(address, tag))
            .peekable();
        values.peek()?;
        Some(values.fold(0u64, |acc, v| acc.wrapping_add(v)))
    }

    /// Run guest code from `start` until the pc reaches `stop`.
    ///
    /// Returns `Ok(true)` when `stop` was reached and `Ok(false)` when a
    /// callback returned [`HookAction::Stop`].
    pub fn run(&mut self, start: u64, stop: u64) -> ExecResult<bool> {
        let mut pc = start;
        loop {
            if pc == stop {
                self.context.gpr_state.rip = pc;
                return Ok(true);
            }
            if self.brokered_call(pc)? {
                pc = self.context.gpr_state.rip;
                continue;
            }
            let cached = self.lookup(pc, stop)?;
            let mut selector = cached.entry;
            loop {
                self.enter(cached.block, selector);
                let Some(pending) = self.blocks[cached.block].pending_callback() else {
                    break;
                };
                match self.dispatch(cached.block, pending)? {
                    HookAction::Continue => selector = self.blocks[cached.block].selector(),
                    HookAction::Stop => return Ok(false),
                    HookAction::Redirect => break,
                }
            }
            pc = self.context.gpr_state.rip;
        }
    }

    fn enter(&mut self, block: usize, selector: u64) {
        let block = &mut self.blocks[block];
        {
            let ctx = block.context_mut();
            ctx.gpr_state = self.context.gpr_state;
            ctx.fpr_state = self.context.fpr_state;
        }
        block.clear_callback();
        block.set_selector(selector);
        // SAFETY: the selector is a placed entry or resume point of this block,
        // and the guest code comes from a range the caller vouched for.
        unsafe { block.execute() };
        let ctx = block.context();
        self.context.gpr_state = ctx.gpr_state;
        self.context.fpr_state = ctx.fpr_state;
    }

    fn dispatch(&mut self, block: usize, pending: PendingCallback) -> ExecResult<HookAction> {
        let (position, callback) = self
            .callbacks
            .get_mut(&pending.id)
            .ok_or(ExecError::UnknownCallback(pending.id))?;
        let position = *position;
        let block = &self.blocks[block];
        let meta = block
            .patch_meta(pending.patch)
            .ok_or(ExecError::UnknownCallback(pending.id))?;
        let accesses = block.memory_accesses(pending.patch, position);

        let saved_rip = self.context.gpr_state.rip;
        self.context.gpr_state.rip = match position {
            InstPosition::PreInst => meta.address,
            InstPosition::PostInst if meta.writes_pc => saved_rip,
            InstPosition::PostInst => meta.address + u64::from(meta.size),
        };
        log::trace!(
            "callback {} at {:#x} ({:?})",
            pending.id,
            meta.address,
            position
        );

        let context = &mut *self.context;
        let mut state = VmState {
            gpr: &mut context.gpr_state,
            fpr: &mut context.fpr_state,
            inst_address: meta.address,
            position,
            memory_accesses: &accesses,
        };
        let action = callback(&mut state);
        if action == HookAction::Continue {
            self.context.gpr_state.rip = saved_rip;
        }
        self.stats.callbacks_dispatched += 1;
        Ok(action)
    }

    /// Run the call to uninstrumented `pc` natively when the guest return
    /// address leads back into an instrumented range.
    fn brokered_call(&mut self, pc: u64) -> ExecResult<bool> {
        if !self.options.exec_broker || self.is_instrumented(pc) {
            return Ok(false);
        }
        // SAFETY: the guest stack is live memory of this process while the guest runs.
        let resume = unsafe { ExecBroker::pending_return(&self.context) };
        if !self.is_instrumented(resume) {
            return Ok(false);
        }
        let broker = match self.broker.take() {
            Some(broker) => broker,
            None => ExecBroker::new()?,
        };
        let broker = self.broker.insert(broker);
        log::debug!("native call to {pc:#x}, returning to {resume:#x}");
        // SAFETY: control reached `pc` through a guest call whose return address
        // is still on the guest stack.
        unsafe { broker.call(&mut self.context, pc) };
        self.stats.native_calls += 1;
        Ok(true)
    }

    fn lookup(&mut self, pc: u64, stop: u64) -> ExecResult<CachedBlock> {
        if let Some(&cached) = self.cache.get(&pc) {
            if !cached.runs_past(pc, stop) {
                self.stats.cache_hits += 1;
                return Ok(cached);
            }
            log::debug!("cached block at {pc:#x} runs past {stop:#x}, translating a shorter one");
        }
        let cached = self.translate(pc, stop)?;
        self.cache.insert(pc, cached);
        Ok(cached)
    }

    /// Translate and place the basic block at `start`.
    fn translate(&mut self, start: u64, stop: u64) -> ExecResult<CachedBlock> {
        if range_end(&self.ranges, start).is_none() {
            return Err(ExecError::NotInstrumented(start));
        }

        let generator = PatchGenerator::new(GeneratorConfig {
            record: self.record,
            hook_order: self.options.hook_order,
        });
        let rules: Vec<&dyn InstrRule> = self.rules.iter().map(|(_, r)| r.as_ref()).collect();
        let session = TranslationSession::new(&self.arena);
        let arena = session.arena();

        let mut patches = Vec::new();
        let mut address = start;
        let mut count = 0;
        loop {
            let Some(end) = range_end(&self.ranges, address) else {
                patches.push(generator.block_exit(arena, address, true)?);
                break;
            };
            let len = MAX_INST_LEN.min((end - address) as usize);
            // SAFETY: [address, address + len) lies in a range registered through
            // `add_instrumented_range`.
            let bytes = unsafe { std::slice::from_raw_parts(address as *const u8, len) };
            let analysis = decode(bytes, address)?;
            let patch = generator.generate(arena, &analysis, rules.iter().copied())?;

            session.record_instruction(&analysis.mnemonic_name());
            session.record_temps(patch.temps.len());
            session.record_shadows(patch.shadows.len());
            count += 1;
            address = analysis.next_address();
            let writes_pc = patch.writes_pc;
            patches.push(patch);

            if analysis.flow.ends_block() || count >= self.options.max_block_insts || address == stop {
                patches.push(generator.block_exit(arena, address, !writes_pc)?);
                break;
            }
        }
        session.record_block_translated(count);
        log::debug!(
            "translated block {:#x}..{:#x} ({} instructions)",
            start,
            address,
            count
        );

        let placed = match self.blocks.last_mut() {
            Some(block) => {
                let before = block.code_remaining();
                block
                    .place(&patches)
                    .map(|entry| (entry, before - block.code_remaining()))
            }
            None => Err(ExecError::ExecBlockFull),
        };
        let (block, entry) = match placed {
            Ok((entry, size)) => {
                session.record_code_size(size);
                (self.blocks.len() - 1, entry)
            }
            Err(ExecError::ExecBlockFull) => {
                let mut fresh = ExecBlock::new(self.options.code_pages)?;
                let before = fresh.code_remaining();
                let entry = fresh.place(&patches).map_err(|err| match err {
                    ExecError::ExecBlockFull => ExecError::SequenceTooLarge { address: start },
                    err => err,
                })?;
                session.record_code_size(before - fresh.code_remaining());
                self.blocks.push(fresh);
                self.stats.exec_blocks_created += 1;
                (self.blocks.len() - 1, entry)
            }
            Err(err) => return Err(err),
        };

        let stats = session.stats();
        drop(patches);
        drop(session);
        self.stats.merge(&stats);
        self.arena.reset();
        Ok(CachedBlock {
            block,
            entry,
            end: address,
        })
    }
}

/// End of the instrumented range holding `address`.
fn range_end(ranges: &[Range<u64>], address: u64) -> Option<u64> {
    ranges
        .iter()
        .find(|r| r.contains(&address))
        .map(|r| r.end)
}
