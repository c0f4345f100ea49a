//! CPU fallback execution.
//!
//! The flattened index space is split into contiguous chunks, one per
//! worker. Each worker interprets the entry point for its indices in
//! order. Shared state is the bound arrays and atomic slots; scalar
//! fields are private to each work-item.

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::schema::{Direction, KernelDescriptor};

use super::interp::{Interp, Trap, WorkItem};
use super::range::Range;
use super::Bound;

/// First fault of a run, with the work-item that raised it.
#[derive(Debug)]
pub(crate) struct RunFault {
    pub global_id: [usize; 3],
    pub trap: Trap,
}

impl std::fmt::Display for RunFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [x, y, z] = self.global_id;
        write!(f, "work-item ({}, {}, {}): {}", x, y, z, self.trap.message)
    }
}

/// Read-write state captured before a run.
pub(crate) struct Snapshot {
    arrays: Vec<(usize, Vec<u64>)>,
    slots: Vec<(usize, Vec<i64>)>,
}

impl Snapshot {
    pub(crate) fn capture(descriptor: &KernelDescriptor, bound: &[Bound]) -> Self {
        let mut arrays = Vec::new();
        let mut slots = Vec::new();
        for (i, (field, b)) in descriptor.fields().iter().zip(bound).enumerate() {
            match b {
                Bound::Array(buf) if field.direction == Direction::ReadWrite => {
                    arrays.push((i, buf.snapshot()))
                }
                Bound::Slots(s) => slots.push((i, s.values())),
                _ => {}
            }
        }
        Self { arrays, slots }
    }

    pub(crate) fn restore(&self, bound: &[Bound]) {
        for (i, bits) in &self.arrays {
            if let Bound::Array(buf) = &bound[*i] {
                buf.restore(bits);
            }
        }
        for (i, values) in &self.slots {
            if let Bound::Slots(s) = &bound[*i] {
                s.restore(values);
            }
        }
    }
}

/// One fallback launch.
pub(crate) struct Launch<'a> {
    pub descriptor: &'a KernelDescriptor,
    pub bound: &'a [Bound],
    pub range: &'a Range,
    pub local: [usize; 3],
    pub pass_id: i32,
}

impl Launch<'_> {
    fn work_item(&self, flat: usize) -> WorkItem {
        WorkItem {
            global_id: self.range.coords(flat),
            global_size: [
                self.range.global_size(0),
                self.range.global_size(1),
                self.range.global_size(2),
            ],
            local_size: self.local,
            pass_id: self.pass_id,
        }
    }

    fn run_chunk(&self, start: usize, end: usize) -> Result<(), RunFault> {
        for flat in start..end {
            let item = self.work_item(flat);
            Interp::new(self.descriptor, self.bound, item)
                .run()
                .map_err(|trap| RunFault {
                    global_id: item.global_id,
                    trap,
                })?;
        }
        Ok(())
    }

    /// Run every work-item on the calling thread.
    pub(crate) fn run_sequential(&self) -> Result<(), RunFault> {
        self.run_chunk(0, self.range.work_items())
    }

    /// Run on `pool`, one contiguous chunk per worker. Returns after
    /// every chunk has finished or one has faulted.
    pub(crate) fn run_on(&self, pool: &ThreadPool) -> Result<(), RunFault> {
        let total = self.range.work_items();
        let chunks = pool.current_num_threads().clamp(1, total.max(1));
        let size = total.div_ceil(chunks);
        pool.install(|| {
            (0..chunks).into_par_iter().try_for_each(|c| {
                let start = c * size;
                let end = ((c + 1) * size).min(total);
                self.run_chunk(start, end)
            })
        })
    }
}
