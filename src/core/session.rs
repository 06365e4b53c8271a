// This module provides arena-based translation session management using the bumpalo crate.
// A TranslationSession lives for the translation of one basic block: it hands out the arena
// that patch sequences, temp bindings and shadow lists are allocated in, and it records
// per-translation statistics. The engine merges the statistics into its long-lived
// SessionStats and resets the arena once the block has been placed, so nothing allocated
// during generation survives placement except the finalized bytes and slot offsets.

//! Arena-based translation session.

use std::cell::RefCell;
use std::fmt;

use bumpalo::Bump;
use hashbrown::HashMap;

/// Arena and counters for translating one basic block.
pub struct TranslationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
}

impl<'arena> TranslationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate an object in the session arena.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    pub fn record_block_translated(&self, instructions: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.blocks_translated += 1;
        stats.largest_block = stats.largest_block.max(instructions);
    }

    /// Record one translated guest instruction.
    pub fn record_instruction(&self, mnemonic: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_translated += 1;
        *stats
            .instruction_counts
            .entry(mnemonic.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_temps(&self, count: usize) {
        self.stats.borrow_mut().temps_allocated += count;
    }

    pub fn record_shadows(&self, count: usize) {
        self.stats.borrow_mut().shadows_allocated += count;
    }

    pub fn record_code_size(&self, bytes: usize) {
        self.stats.borrow_mut().code_size += bytes;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Translation and execution statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub blocks_translated: usize,
    pub instructions_translated: usize,
    pub instruction_counts: HashMap<String, usize>,
    /// Most instructions seen in one basic block.
    pub largest_block: usize,
    pub temps_allocated: usize,
    pub shadows_allocated: usize,
    /// Bytes of translated code placed.
    pub code_size: usize,
    pub exec_blocks_created: usize,
    pub cache_hits: usize,
    pub callbacks_dispatched: usize,
    /// Calls into uninstrumented code run natively.
    pub native_calls: usize,
}

impl SessionStats {
    /// Fold the counters of one translation into `self`.
    pub fn merge(&mut self, other: &SessionStats) {
        self.blocks_translated += other.blocks_translated;
        self.instructions_translated += other.instructions_translated;
        for (name, count) in &other.instruction_counts {
            *self.instruction_counts.entry(name.clone()).or_insert(0) += count;
        }
        self.largest_block = self.largest_block.max(other.largest_block);
        self.temps_allocated += other.temps_allocated;
        self.shadows_allocated += other.shadows_allocated;
        self.code_size += other.code_size;
        self.exec_blocks_created += other.exec_blocks_created;
        self.cache_hits += other.cache_hits;
        self.callbacks_dispatched += other.callbacks_dispatched;
        self.native_calls += other.native_calls;
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Translation Statistics:")?;
        writeln!(f, "  Blocks translated: {}", self.blocks_translated)?;
        writeln!(f, "  Instructions translated: {}", self.instructions_translated)?;
        writeln!(f, "  Largest block: {} instructions", self.largest_block)?;
        writeln!(f, "  Code size: {} bytes", self.code_size)?;
        writeln!(f, "  Temps allocated: {}", self.temps_allocated)?;
        writeln!(f, "  Shadows allocated: {}", self.shadows_allocated)?;
        writeln!(f, "  Exec blocks: {}", self.exec_blocks_created)?;
        writeln!(f, "  Cache hits: {}", self.cache_hits)?;
        writeln!(f, "  Callbacks dispatched: {}", self.callbacks_dispatched)?;
        writeln!(f, "  Native calls: {}", self.native_calls)?;

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

            for (mnemonic, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", mnemonic, count)?;
            }
        }

        Ok(())
    }
}
