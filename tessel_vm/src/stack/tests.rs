use proptest::prelude::*;

use super::*;
use crate::{
    code_unit::CodeUnitId,
    config::MemoryBackend,
    frame::{CallerLink, CodeRef},
};

/// 100 slots with a 10-slot commit chunk, on the heap.
fn small_stack(max_excess_capacity: usize) -> InterpreterStack {
    let config = StackConfig::new(100, 80, max_excess_capacity, MemoryBackend::Heap);
    InterpreterStack::new(StackContext::initialize(), &config).expect("Expected a stack")
}

#[derive(Default)]
struct CollectRoots(Vec<Register>);

impl RootVisitor for CollectRoots {
    fn add_roots(&mut self, roots: &[Register]) {
        self.0.extend_from_slice(roots);
    }
}

#[derive(Default)]
struct CountCandidates(usize);

impl AuxiliaryRoots for CountCandidates {
    fn note_candidate(&mut self, candidate: Register) {
        if !candidate.is_empty() {
            self.0 += 1;
        }
    }
}

#[test]
fn new_stack_is_empty() {
    let stack = small_stack(0);

    assert!(stack.is_empty());
    assert_eq!(stack.commit_end(), 0);
    assert_eq!(stack.reserved_end(), 100);
    assert_eq!(stack.usable_end(), 90);
    assert!(!stack.error_reserve_enabled());
    assert_eq!(stack.committed_byte_count(), 0);
}

#[test]
fn rejects_invalid_config() {
    let config = StackConfig::new(100, 12, 0, MemoryBackend::Heap);
    let res = InterpreterStack::new(StackContext::initialize(), &config);
    assert!(matches!(res, Err(NewStackError::Config(_))));
}

#[test]
fn grow_commits_whole_chunks() {
    let mut stack = small_stack(0);

    assert!(stack.grow(5));
    assert_eq!(stack.top(), 5);
    assert_eq!(stack.commit_end(), 10);
    assert_eq!(stack.committed_byte_count(), 80);

    // Already committed, so nothing new is needed.
    assert!(stack.grow(10));
    assert_eq!(stack.commit_end(), 10);

    assert!(stack.grow(31));
    assert_eq!(stack.top(), 31);
    assert_eq!(stack.commit_end(), 40);
    assert_eq!(stack.committed_byte_count(), 320);
}

#[test]
fn grow_never_lowers_top() {
    let mut stack = small_stack(0);

    assert!(stack.grow(20));
    assert!(stack.grow(3));
    assert_eq!(stack.top(), 20);
}

#[test]
fn grow_stops_at_error_reserve() {
    let mut stack = small_stack(0);

    assert!(stack.grow(90));
    assert_eq!(stack.commit_end(), 90);

    assert!(!stack.grow(91));
    assert_eq!(stack.top(), 90);
    assert_eq!(stack.commit_end(), 90);
}

#[test]
fn failed_grow_changes_nothing() {
    let mut stack = small_stack(0);
    assert!(stack.grow(15));

    assert!(!stack.grow(95));
    assert_eq!(stack.top(), 15);
    assert_eq!(stack.commit_end(), 20);
    assert_eq!(stack.committed_byte_count(), 160);
}

#[test]
fn far_out_grow_fails_cleanly() {
    let mut stack = small_stack(0);
    assert!(stack.grow(15));

    for new_top in [usize::MAX / 4, usize::MAX / Register::SIZE + 1, usize::MAX] {
        assert!(!stack.grow(new_top));
        assert_eq!(stack.top(), 15);
        assert_eq!(stack.commit_end(), 20);
        assert_eq!(stack.committed_byte_count(), 160);
    }

    stack.enable_error_reserve();
    assert!(!stack.grow(usize::MAX / 4));
    assert_eq!(stack.commit_end(), 20);
    stack.disable_error_reserve();
}

#[test]
fn error_reserve_round_trip() {
    let mut stack = small_stack(0);
    assert!(stack.grow(90));

    stack.enable_error_reserve();
    assert!(stack.error_reserve_enabled());
    assert!(stack.grow(95));
    assert_eq!(stack.commit_end(), 100);

    stack.disable_error_reserve();
    assert!(!stack.error_reserve_enabled());
    assert_eq!(stack.usable_end(), 90);
    assert_eq!(stack.top(), 90);
    assert_eq!(stack.commit_end(), 90);
    assert_eq!(stack.committed_byte_count(), 720);
}

#[test]
fn disable_without_use_keeps_commit() {
    let mut stack = small_stack(0);
    assert!(stack.grow(42));

    stack.enable_error_reserve();
    stack.disable_error_reserve();

    assert_eq!(stack.top(), 42);
    assert_eq!(stack.commit_end(), 50);
}

#[test]
fn shrink_never_raises_top() {
    let mut stack = small_stack(0);
    assert!(stack.grow(20));

    stack.shrink(30);
    assert_eq!(stack.top(), 20);

    stack.shrink(12);
    assert_eq!(stack.top(), 12);
    assert_eq!(stack.commit_end(), 20);
}

#[test]
fn empty_stack_releases_excess() {
    let mut stack = small_stack(80);
    assert!(stack.grow(25));
    assert_eq!(stack.committed_byte_count(), 240);

    stack.shrink(0);
    assert!(stack.is_empty());
    assert_eq!(stack.commit_end(), 0);
    assert_eq!(stack.committed_byte_count(), 0);
}

#[test]
fn empty_stack_keeps_small_commit() {
    let mut stack = small_stack(80);
    assert!(stack.grow(8));
    assert_eq!(stack.committed_byte_count(), 80);

    // Exactly at the threshold, not past it.
    stack.shrink(0);
    assert_eq!(stack.commit_end(), 10);
    assert_eq!(stack.committed_byte_count(), 80);
}

#[test]
fn release_excess_capacity_needs_empty_stack() {
    let mut stack = small_stack(1024);
    assert!(stack.grow(25));

    stack.release_excess_capacity();
    assert_eq!(stack.commit_end(), 30);

    stack.shrink(0);
    assert_eq!(stack.commit_end(), 30);

    stack.release_excess_capacity();
    assert_eq!(stack.commit_end(), 0);
    assert_eq!(stack.committed_byte_count(), 0);
}

#[test]
fn recommitted_slots_are_zero() {
    let mut stack = small_stack(0);
    assert!(stack.grow(4));
    stack.set_slot(3, Register::from(0xfeed));

    stack.shrink(0);
    assert!(stack.grow(4));
    assert_eq!(stack.slot(3), Register::EMPTY);
}

#[test]
fn contexts_are_shared() {
    let context = StackContext::initialize();
    let config = StackConfig::new(100, 80, 0, MemoryBackend::Heap);

    let mut first = InterpreterStack::new(context.clone(), &config).unwrap();
    let mut second = InterpreterStack::new(context.clone(), &config).unwrap();

    assert!(first.grow(10));
    assert!(second.grow(11));
    assert_eq!(context.committed_byte_count(), 80 + 160);

    drop(second);
    assert_eq!(context.committed_byte_count(), 80);
    drop(first);
    assert_eq!(context.committed_byte_count(), 0);
}

#[test]
fn gather_roots_covers_stack_in_use() {
    let mut stack = small_stack(0);
    assert!(stack.grow(6));
    stack.set_slot(0, Register::from(1));
    stack.set_slot(5, Register::from(2));

    let mut roots = CollectRoots::default();
    stack.gather_conservative_roots(&mut roots);
    assert_eq!(roots.0.len(), 6);
    assert_eq!(roots.0[0], Register::from(1));
    assert_eq!(roots.0[5], Register::from(2));

    let mut roots = CollectRoots::default();
    let mut stubs = CountCandidates::default();
    stack.gather_conservative_roots_with(&mut roots, &mut [&mut stubs]);
    assert_eq!(roots.0.len(), 6);
    assert_eq!(stubs.0, 2);
}

#[cfg(unix)]
#[test]
fn os_backed_stack() {
    let page = memory::page_size();
    let config = StackConfig::new(page, page, 0, MemoryBackend::Os);
    let mut stack = InterpreterStack::new(StackContext::initialize(), &config)
        .expect("Expected an OS-backed stack");

    assert!(stack.grow(3));
    assert_eq!(stack.committed_bytes(), page);
    stack.set_slot(2, Register::from(7));
    assert_eq!(stack.slot(2), Register::from(7));

    stack.shrink(0);
    assert_eq!(stack.committed_bytes(), 0);
}

proptest! {
    #[test]
    fn commit_tracks_high_water_mark(tops in prop::collection::vec(0usize..=100, 1..32)) {
        let mut stack = small_stack(usize::MAX);
        let mut high = 0;

        for top in tops {
            let previous_commit = stack.commit_end();

            if stack.grow(top) {
                high = high.max(top);
                prop_assert!(stack.top() >= top);
            } else {
                prop_assert!(top > stack.usable_end());
                prop_assert_eq!(stack.commit_end(), previous_commit);
            }

            prop_assert!(stack.commit_end() >= previous_commit);
            prop_assert!(stack.top() <= stack.commit_end());
            prop_assert!(stack.commit_end() <= stack.usable_end());
            prop_assert_eq!(stack.commit_end() % 10, 0);
            // Never more than one chunk past what was asked for.
            prop_assert!(stack.commit_end() < high + 10 || high == 0);

            stack.shrink(top / 2);
        }
    }

    #[test]
    fn push_pop_restores_top(depth in 1usize..60) {
        let mut stack = small_stack(0);
        prop_assert!(stack.grow(7));
        let base = stack.top();

        if stack.grow(base + depth) {
            stack.shrink(base);
        }

        prop_assert_eq!(stack.top(), base);
        prop_assert!(stack.commit_end() >= base);
    }

    #[test]
    fn frame_push_pop_keeps_commit(
        argument_count in 0u32..8,
        local_registers in 0u32..40,
        precommit in any::<bool>(),
    ) {
        let mut stack = small_stack(0);
        let entry = stack
            .push(CallerLink::Host(None), None, Register::EMPTY, 0, Register::EMPTY)
            .unwrap();
        let entry_extent = stack.frame(entry).frame_extent();

        if precommit {
            prop_assert!(stack.grow(80));
            stack.shrink(entry_extent);
        }

        let top = stack.top();
        let committed = stack.committed_byte_count();

        let code = Some(CodeRef {
            id: CodeUnitId::new(0),
            local_registers,
        });
        let frame = stack
            .push(CallerLink::Frame(entry), code, Register::EMPTY, argument_count, Register::EMPTY)
            .unwrap();
        let committed_after_push = stack.committed_byte_count();

        stack.pop(frame);

        prop_assert_eq!(stack.top(), top);
        prop_assert_eq!(stack.committed_byte_count(), committed_after_push);
        if precommit {
            prop_assert_eq!(stack.committed_byte_count(), committed);
        }
    }
}
