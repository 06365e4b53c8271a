//! Per-patch shadow allocation.
//!
//! Tags handed out here are only names. The exec block turns each
//! (patch, tag) pair into a concrete data slot when the patch is placed.

use super::error::PatchError;
use super::types::{Shadow, MEMORY_TAG_BEGIN, MEMORY_TAG_END};

/// Upper bound on shadows a single patch may request.
pub const MAX_SHADOWS_PER_PATCH: usize = 32;

#[derive(Debug, Default, Clone)]
pub struct ShadowAllocator {
    allocated: Vec<Shadow>,
}

impl ShadowAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a shadow with a caller-chosen tag.
    pub fn allocate(&mut self, tag: u16) -> Result<Shadow, PatchError> {
        if tag == Shadow::UNTAGGED {
            return Err(PatchError::UntaggedShadow);
        }
        if Shadow::is_memory_tag(tag) {
            return Err(PatchError::ReservedShadowTag(tag));
        }
        if self.contains(tag) {
            return Err(PatchError::DuplicateShadowTag(tag));
        }
        self.push(Shadow::new(tag))
    }

    /// Allocate the lowest user tag not yet in use.
    pub fn allocate_fresh(&mut self) -> Result<Shadow, PatchError> {
        let tag = (0..MEMORY_TAG_BEGIN)
            .find(|&t| !self.contains(t))
            .ok_or(PatchError::ShadowExhausted {
                requested: self.allocated.len() + 1,
            })?;
        self.push(Shadow::new(tag))
    }

    /// Engine-internal allocation in the reserved memory range.
    ///
    /// Asking twice for the same tag returns the same shadow, so the pre and
    /// post halves of a memory hook share their slots.
    pub(crate) fn allocate_memory(&mut self, tag: u16) -> Result<Shadow, PatchError> {
        debug_assert!((MEMORY_TAG_BEGIN..MEMORY_TAG_END).contains(&tag));
        if self.contains(tag) {
            return Ok(Shadow::new(tag));
        }
        self.push(Shadow::new(tag))
    }

    pub fn contains(&self, tag: u16) -> bool {
        self.allocated.iter().any(|s| s.tag() == tag)
    }

    pub fn allocated(&self) -> &[Shadow] {
        &self.allocated
    }

    pub fn len(&self) -> usize {
        self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }

    fn push(&mut self, shadow: Shadow) -> Result<Shadow, PatchError> {
        if self.allocated.len() >= MAX_SHADOWS_PER_PATCH {
            return Err(PatchError::ShadowExhausted {
                requested: self.allocated.len() + 1,
            });
        }
        self.allocated.push(shadow);
        Ok(shadow)
    }
}
