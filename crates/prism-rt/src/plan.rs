//! Device-independent planning of batched BLAS builds.
//!
//! Splitting a batch, sizing the shared scratch buffer and ordering the
//! commands of one sub-batch are pure decisions; [`BuildCommands`] is the
//! seam where they meet a command buffer.

use ash::vk;
use prism_core::constants::MIB;
use prism_gpu::memory::align_up;
use std::ops::{Deref, DerefMut, Range};

/// Declared acceleration structure bytes per sub-batch submission.
pub const DEFAULT_BATCH_BUDGET: u64 = 256 * MIB;

/// Split builds into consecutive sub-batches by declared size.
///
/// A sub-batch closes once its accumulated size reaches `budget`, so every
/// sub-batch holds at least one build and only its last build may push it
/// over the budget.
pub fn partition_batches(sizes: &[u64], budget: u64) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut accumulated = 0u64;

    for (index, &size) in sizes.iter().enumerate() {
        accumulated = accumulated.saturating_add(size);
        if accumulated >= budget {
            batches.push(start..index + 1);
            start = index + 1;
            accumulated = 0;
        }
    }
    if start < sizes.len() {
        batches.push(start..sizes.len());
    }

    batches
}

/// Whether a batch is compacted.
///
/// # Panics
/// If some but not all builds allow compaction.
pub fn compaction_requested<I>(flags: I) -> bool
where
    I: IntoIterator<Item = vk::BuildAccelerationStructureFlagsKHR>,
{
    let (total, compacting) = flags.into_iter().fold((0usize, 0usize), |(t, c), f| {
        let allows = f.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION);
        (t + 1, c + usize::from(allows))
    });

    assert!(
        compacting == 0 || compacting == total,
        "BLAS batch mixes compacted and non-compacted builds ({compacting} of {total} allow compaction)"
    );

    compacting > 0
}

/// Bytes to allocate for a scratch buffer whose start address must be
/// aligned to `alignment` and that must hold `required` bytes after it.
pub fn scratch_buffer_size(required: u64, alignment: u64) -> u64 {
    required + alignment.max(1)
}

/// Aligned scratch address inside a buffer starting at `base`.
pub fn scratch_address(base: vk::DeviceAddress, alignment: u64) -> vk::DeviceAddress {
    align_up(base, alignment.max(1))
}

/// Percentage of `original` saved by shrinking it to `compacted`.
pub fn percent_saved(original: u64, compacted: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    (original.saturating_sub(compacted)) as f64 * 100.0 / original as f64
}

/// Commands recorded for one sub-batch.
///
/// Indices are positions in the whole batch; query indices equal build
/// indices.
pub trait BuildCommands {
    /// Build the acceleration structure at `index`.
    fn build(&mut self, index: usize);

    /// Order a build after the previous one that used the shared scratch
    /// buffer.
    fn scratch_barrier(&mut self);

    /// Reset compacted-size queries before they are written again.
    fn reset_queries(&mut self, first: u32, count: u32);

    /// Make finished builds visible to the size queries.
    fn build_to_query_barrier(&mut self);

    /// Write the compacted sizes of `indices` into their queries.
    fn write_compacted_sizes(&mut self, indices: Range<usize>);
}

/// Record the builds of `batch`.
///
/// K builds get K-1 scratch barriers between them. With compaction the
/// queries of the sub-batch are reset first and written once after one
/// final barrier.
pub fn record_sub_batch<C: BuildCommands>(commands: &mut C, batch: Range<usize>, compact: bool) {
    if batch.is_empty() {
        return;
    }

    if compact {
        commands.reset_queries(batch.start as u32, batch.len() as u32);
    }

    for index in batch.clone() {
        if index > batch.start {
            commands.scratch_barrier();
        }
        commands.build(index);
    }

    if compact {
        commands.build_to_query_barrier();
        commands.write_compacted_sizes(batch);
    }
}

/// Structures created while a batch is in flight.
///
/// Unless [`Self::finish`] takes them, every item still held when the guard
/// drops is passed to `release`, so an early `?` does not leak what earlier
/// sub-batches already built.
pub struct BuildGuard<'a, T> {
    items: Vec<T>,
    release: Box<dyn FnMut(T) + 'a>,
}

impl<'a, T> BuildGuard<'a, T> {
    pub fn new(capacity: usize, release: impl FnMut(T) + 'a) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            release: Box::new(release),
        }
    }

    /// Keep the items; nothing is released.
    pub fn finish(mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }
}

impl<T> Deref for BuildGuard<'_, T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.items
    }
}

impl<T> DerefMut for BuildGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.items
    }
}

impl<T> Drop for BuildGuard<'_, T> {
    fn drop(&mut self) {
        for item in self.items.drain(..) {
            (self.release)(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Command {
        Build(usize),
        ScratchBarrier,
        ResetQueries(u32, u32),
        QueryBarrier,
        WriteSizes(Range<usize>),
    }

    #[derive(Default)]
    struct Recorder {
        commands: Vec<Command>,
    }

    impl Recorder {
        fn count(&self, wanted: &Command) -> usize {
            self.commands.iter().filter(|c| *c == wanted).count()
        }
    }

    impl BuildCommands for Recorder {
        fn build(&mut self, index: usize) {
            self.commands.push(Command::Build(index));
        }

        fn scratch_barrier(&mut self) {
            self.commands.push(Command::ScratchBarrier);
        }

        fn reset_queries(&mut self, first: u32, count: u32) {
            self.commands.push(Command::ResetQueries(first, count));
        }

        fn build_to_query_barrier(&mut self) {
            self.commands.push(Command::QueryBarrier);
        }

        fn write_compacted_sizes(&mut self, indices: Range<usize>) {
            self.commands.push(Command::WriteSizes(indices));
        }
    }

    #[test]
    fn batches_close_at_budget() {
        let batches = partition_batches(&[100, 100, 100, 100, 100], 250);
        assert_eq!(batches, vec![0..3, 3..5]);
    }

    #[test]
    fn batch_closes_exactly_at_budget() {
        let batches = partition_batches(&[128, 128, 128], 256);
        assert_eq!(batches, vec![0..2, 2..3]);
    }

    #[test]
    fn oversized_build_closes_the_open_batch() {
        // Joins the build before it; the batch then exceeds the budget.
        let batches = partition_batches(&[10, 1000, 10], 256);
        assert_eq!(batches, vec![0..2, 2..3]);

        let batches = partition_batches(&[1000, 1000], 256);
        assert_eq!(batches, vec![0..1, 1..2]);
    }

    #[test]
    fn small_batch_fits_in_one_submission() {
        let sizes = vec![4 * MIB; 10];
        assert_eq!(partition_batches(&sizes, DEFAULT_BATCH_BUDGET), vec![0..10]);
    }

    #[test]
    fn empty_batch_has_no_submissions() {
        assert!(partition_batches(&[], DEFAULT_BATCH_BUDGET).is_empty());
    }

    #[test]
    fn batches_cover_every_build_once() {
        let sizes: Vec<u64> = (1..=50).map(|i| i * 7 * MIB).collect();
        let batches = partition_batches(&sizes, DEFAULT_BATCH_BUDGET);

        let mut next = 0;
        for batch in &batches {
            assert_eq!(batch.start, next);
            assert!(!batch.is_empty());
            next = batch.end;
        }
        assert_eq!(next, sizes.len());
    }

    #[test]
    fn compaction_all_or_none() {
        let fast = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        let compact = fast | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;

        assert!(!compaction_requested([fast, fast]));
        assert!(compaction_requested([compact, compact, compact]));
        assert!(!compaction_requested(std::iter::empty()));
    }

    #[test]
    #[should_panic(expected = "mixes compacted and non-compacted")]
    fn mixed_compaction_panics() {
        compaction_requested([
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        ]);
    }

    #[test]
    fn scratch_is_padded_for_alignment() {
        assert_eq!(scratch_buffer_size(1000, 128), 1128);
        assert_eq!(scratch_address(0x1001, 128), 0x1080);
        assert_eq!(scratch_address(0x1000, 128), 0x1000);
        // The aligned range still fits for any base address.
        let base = 0x10_0001;
        let aligned = scratch_address(base, 256);
        assert!(aligned + 1000 <= base + scratch_buffer_size(1000, 256));
    }

    #[test]
    fn k_builds_get_k_minus_one_scratch_barriers() {
        for k in 1..6 {
            let mut recorder = Recorder::default();
            record_sub_batch(&mut recorder, 3..3 + k, false);

            assert_eq!(recorder.count(&Command::ScratchBarrier), k - 1);
            let builds: Vec<_> = recorder
                .commands
                .iter()
                .filter_map(|c| match c {
                    Command::Build(i) => Some(*i),
                    _ => None,
                })
                .collect();
            assert_eq!(builds, (3..3 + k).collect::<Vec<_>>());
        }
    }

    #[test]
    fn barriers_sit_between_builds() {
        let mut recorder = Recorder::default();
        record_sub_batch(&mut recorder, 0..3, false);

        assert_eq!(
            recorder.commands,
            vec![
                Command::Build(0),
                Command::ScratchBarrier,
                Command::Build(1),
                Command::ScratchBarrier,
                Command::Build(2),
            ]
        );
    }

    #[test]
    fn compaction_queries_follow_the_builds() {
        let mut recorder = Recorder::default();
        record_sub_batch(&mut recorder, 4..6, true);

        assert_eq!(
            recorder.commands,
            vec![
                Command::ResetQueries(4, 2),
                Command::Build(4),
                Command::ScratchBarrier,
                Command::Build(5),
                Command::QueryBarrier,
                Command::WriteSizes(4..6),
            ]
        );
    }

    #[test]
    fn empty_sub_batch_records_nothing() {
        let mut recorder = Recorder::default();
        record_sub_batch(&mut recorder, 2..2, true);
        assert!(recorder.commands.is_empty());
    }

    #[test]
    fn compaction_savings() {
        assert_relative_eq!(percent_saved(1000, 250), 75.0);
        assert_relative_eq!(percent_saved(1000, 1000), 0.0);
        assert_relative_eq!(percent_saved(0, 0), 0.0);
    }

    #[test]
    fn guard_releases_items_on_early_return() {
        use std::cell::RefCell;

        let create = |n: u32| if n < 3 { Ok(n) } else { Err("out of memory") };
        let released = RefCell::new(Vec::new());
        let failing_batch = || -> Result<Vec<u32>, &'static str> {
            let mut built = BuildGuard::new(4, |item| released.borrow_mut().push(item));
            for n in 1..=4 {
                built.push(create(n)?);
            }
            Ok(built.finish())
        };

        assert_eq!(failing_batch(), Err("out of memory"));
        assert_eq!(*released.borrow(), vec![1, 2]);
    }

    #[test]
    fn finished_guard_releases_nothing() {
        let mut released = 0;
        let mut built = BuildGuard::new(2, |_: u32| released += 1);
        built.extend([7, 8]);
        built[1] = 9;
        let kept = built.finish();

        assert_eq!(kept, vec![7, 9]);
        assert_eq!(released, 0);
    }
}
