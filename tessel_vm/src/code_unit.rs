//! Compiled code as the stack sees it.
//!
//! The stack never looks at instructions. All it needs from a code unit is
//! a way to map machine locations back to bytecode origins, and the inline
//! frame descriptors those origins refer to.

use std::{fmt, sync::Arc};

use crate::inline::{InlineFrame, InlineFrameArena, InlineFrameId};

/// An offset into a code unit's machine code.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CodeLocation(u64);

impl CodeLocation {
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub const fn offset(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A bytecode index, together with the inline frame it belongs to.
/// `inline_frame` is `None` for code in the outermost function.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CodeOrigin {
    pub bytecode_index: u32,
    pub inline_frame: Option<InlineFrameId>,
}

impl CodeOrigin {
    pub const fn new(bytecode_index: u32) -> Self {
        Self {
            bytecode_index,
            inline_frame: None,
        }
    }

    pub const fn inlined(bytecode_index: u32, inline_frame: InlineFrameId) -> Self {
        Self {
            bytecode_index,
            inline_frame: Some(inline_frame),
        }
    }
}

pub trait CodeUnit: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn instruction_count(&self) -> usize;
    /// Number of local registers a frame running this code needs.
    fn local_register_count(&self) -> u32;

    fn inline_frames(&self) -> &InlineFrameArena;

    fn has_inlined_frames(&self) -> bool {
        !self.inline_frames().is_empty()
    }

    /// The origin of the call that returns to `location`.
    fn code_origin_for_return(&self, location: CodeLocation) -> Option<CodeOrigin>;

    /// The origin of the call whose machine code contains `location`.
    fn code_origin_for_call_site(&self, location: CodeLocation) -> Option<CodeOrigin>;

    /// An origin captured by machine code before calling out.
    fn code_origin_at_index(&self, index: u32) -> Option<CodeOrigin>;
    fn code_origin_count(&self) -> usize;

    /// The location of the call instruction returning to `location`.
    fn call_site_for_return(&self, location: CodeLocation) -> Option<CodeLocation>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CallSite {
    /// First location of the call sequence.
    pub start: CodeLocation,
    /// Where the call returns to. Always past `start`.
    pub return_location: CodeLocation,
    pub origin: CodeOrigin,
}

impl CallSite {
    pub fn contains(&self, location: CodeLocation) -> bool {
        self.start <= location && location < self.return_location
    }
}

/// A table-driven code unit, as produced by a compiler.
#[derive(Clone, Debug, Default)]
pub struct CompiledCode {
    name: String,
    instruction_count: usize,
    local_registers: u32,
    call_sites: Vec<CallSite>,
    captured_origins: Vec<CodeOrigin>,
    inline_frames: InlineFrameArena,
}

impl CompiledCode {
    pub fn new(name: impl Into<String>, instruction_count: usize, local_registers: u32) -> Self {
        Self {
            name: name.into(),
            instruction_count,
            local_registers,
            ..Self::default()
        }
    }

    pub fn add_inline_frame(&mut self, frame: InlineFrame) -> InlineFrameId {
        self.inline_frames.push(frame)
    }

    pub fn add_call_site(
        &mut self,
        start: CodeLocation,
        return_location: CodeLocation,
        origin: CodeOrigin,
    ) {
        debug_assert!(start < return_location);

        let site = CallSite {
            start,
            return_location,
            origin,
        };

        let index = self
            .call_sites
            .partition_point(|other| other.return_location < return_location);
        self.call_sites.insert(index, site);
    }

    /// Records an origin for machine code to capture,
    /// returning the index it will be stored under.
    pub fn capture_origin(&mut self, origin: CodeOrigin) -> u32 {
        self.captured_origins.push(origin);
        (self.captured_origins.len() - 1) as u32
    }

    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    fn call_site_returning_to(&self, location: CodeLocation) -> Option<&CallSite> {
        self.call_sites
            .binary_search_by_key(&location, |site| site.return_location)
            .ok()
            .map(|index| &self.call_sites[index])
    }
}

impl CodeUnit for CompiledCode {
    fn name(&self) -> &str {
        &self.name
    }

    fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    fn local_register_count(&self) -> u32 {
        self.local_registers
    }

    fn inline_frames(&self) -> &InlineFrameArena {
        &self.inline_frames
    }

    fn code_origin_for_return(&self, location: CodeLocation) -> Option<CodeOrigin> {
        self.call_site_returning_to(location).map(|site| site.origin)
    }

    fn code_origin_for_call_site(&self, location: CodeLocation) -> Option<CodeOrigin> {
        // Call sites are sorted by return location and never overlap,
        // so the first one ending past `location` is the only candidate.
        let index = self
            .call_sites
            .partition_point(|site| site.return_location <= location);

        self.call_sites
            .get(index)
            .filter(|site| site.contains(location))
            .map(|site| site.origin)
    }

    fn code_origin_at_index(&self, index: u32) -> Option<CodeOrigin> {
        self.captured_origins.get(index as usize).copied()
    }

    fn code_origin_count(&self) -> usize {
        self.captured_origins.len()
    }

    fn call_site_for_return(&self, location: CodeLocation) -> Option<CodeLocation> {
        self.call_site_returning_to(location).map(|site| site.start)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CodeUnitId(u32);

impl CodeUnitId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CodeUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Every code unit a VM knows about.
///
/// Ids are never reused. Removing a code unit leaves a tombstone behind,
/// so frames still naming it see it as missing.
#[derive(Debug, Default)]
pub struct CodeUnitTable {
    units: Vec<Option<Arc<dyn CodeUnit>>>,
}

impl CodeUnitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, unit: Arc<dyn CodeUnit>) -> CodeUnitId {
        self.units.push(Some(unit));
        CodeUnitId((self.units.len() - 1) as u32)
    }

    pub fn get(&self, id: CodeUnitId) -> Option<&Arc<dyn CodeUnit>> {
        self.units.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn remove(&mut self, id: CodeUnitId) -> Option<Arc<dyn CodeUnit>> {
        self.units.get_mut(id.0 as usize).and_then(Option::take)
    }

    /// Number of live code units.
    pub fn len(&self) -> usize {
        self.units.iter().filter(|unit| unit.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(offset: u64) -> CodeLocation {
        CodeLocation::new(offset)
    }

    fn code() -> CompiledCode {
        let mut code = CompiledCode::new("f", 40, 3);
        code.add_call_site(loc(0x20), loc(0x28), CodeOrigin::new(7));
        code.add_call_site(loc(0x08), loc(0x10), CodeOrigin::new(2));
        code.add_call_site(loc(0x10), loc(0x18), CodeOrigin::new(4));
        code
    }

    #[test]
    fn origin_for_return_is_exact() {
        let code = code();
        assert_eq!(code.code_origin_for_return(loc(0x10)), Some(CodeOrigin::new(2)));
        assert_eq!(code.code_origin_for_return(loc(0x28)), Some(CodeOrigin::new(7)));
        assert_eq!(code.code_origin_for_return(loc(0x0c)), None);
    }

    #[test]
    fn origin_for_call_site_covers_call_sequence() {
        let code = code();
        assert_eq!(code.code_origin_for_call_site(loc(0x08)), Some(CodeOrigin::new(2)));
        assert_eq!(code.code_origin_for_call_site(loc(0x0f)), Some(CodeOrigin::new(2)));
        assert_eq!(code.code_origin_for_call_site(loc(0x10)), Some(CodeOrigin::new(4)));
        assert_eq!(code.code_origin_for_call_site(loc(0x1c)), None);
        assert_eq!(code.code_origin_for_call_site(loc(0x40)), None);
    }

    #[test]
    fn call_site_for_return() {
        let code = code();
        assert_eq!(code.call_site_for_return(loc(0x18)), Some(loc(0x10)));
        assert_eq!(code.call_site_for_return(loc(0x14)), None);
    }

    #[test]
    fn captured_origins() {
        let mut code = code();
        assert_eq!(code.code_origin_count(), 0);

        let index = code.capture_origin(CodeOrigin::new(11));
        assert_eq!(code.code_origin_at_index(index), Some(CodeOrigin::new(11)));
        assert_eq!(code.code_origin_at_index(index + 1), None);
        assert_eq!(code.code_origin_count(), 1);
    }

    #[test]
    fn table_leaves_tombstones() {
        let mut table = CodeUnitTable::new();
        let first = table.insert(Arc::new(code()));
        let second = table.insert(Arc::new(CompiledCode::new("g", 1, 0)));

        assert_eq!(table.len(), 2);
        assert!(table.remove(first).is_some());
        assert!(table.get(first).is_none());
        assert!(table.remove(first).is_none());
        assert_eq!(table.get(second).map(|unit| unit.name()), Some("g"));
        assert_eq!(table.len(), 1);

        let third = table.insert(Arc::new(CompiledCode::new("h", 1, 0)));
        assert_ne!(third, first);
    }
}
