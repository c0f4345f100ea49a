//! Atomic operation abstraction shared by both execution backends.
//!
//! The vocabulary is fixed. Every operation is defined once, by
//! [`AtomicOp::next`], as a pure function from the slot's current value
//! to its next value. The fallback backend applies that function inside
//! a compare-and-swap loop on a lock-free cell; the OpenCL translator
//! maps each operation onto the native `atomic_*` / `atom_*` built-in
//! with the same fetch semantics. Both therefore agree on the "old" and
//! "new" values for identical inputs.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Bit width of an atomic slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomicWidth {
    /// 32-bit, the kernel-side `AtomicInteger`.
    Int,
    /// 64-bit, the kernel-side `AtomicLong`. Needs the int64 atomics
    /// extensions on the device.
    Long,
}

impl AtomicWidth {
    pub fn bits(self) -> u32 {
        match self {
            AtomicWidth::Int => 32,
            AtomicWidth::Long => 64,
        }
    }

    /// Sign-extend `v` from this width.
    pub fn wrap(self, v: i64) -> i64 {
        match self {
            AtomicWidth::Int => v as i32 as i64,
            AtomicWidth::Long => v,
        }
    }

    /// Element type of the OpenCL storage.
    pub fn cl_name(self) -> &'static str {
        match self {
            AtomicWidth::Int => "int",
            AtomicWidth::Long => "long",
        }
    }
}

/// Where a slot lives on the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    #[default]
    Global,
    /// Work-group local memory.
    Local,
}

impl MemoryScope {
    pub fn cl_qualifier(self) -> &'static str {
        match self {
            MemoryScope::Global => "__global",
            MemoryScope::Local => "__local",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicOp {
    Set,
    Get,
    Add,
    Sub,
    Xchg,
    Inc,
    Dec,
    CmpXchg,
    Min,
    Max,
    And,
    Or,
    Xor,
}

impl AtomicOp {
    pub const ALL: [AtomicOp; 13] = [
        AtomicOp::Set,
        AtomicOp::Get,
        AtomicOp::Add,
        AtomicOp::Sub,
        AtomicOp::Xchg,
        AtomicOp::Inc,
        AtomicOp::Dec,
        AtomicOp::CmpXchg,
        AtomicOp::Min,
        AtomicOp::Max,
        AtomicOp::And,
        AtomicOp::Or,
        AtomicOp::Xor,
    ];

    /// Number of operands besides the slot.
    pub fn arity(self) -> usize {
        match self {
            AtomicOp::Get | AtomicOp::Inc | AtomicOp::Dec => 0,
            AtomicOp::CmpXchg => 2,
            _ => 1,
        }
    }

    /// Whether the operation can store into the slot.
    pub fn writes(self) -> bool {
        self != AtomicOp::Get
    }

    /// Kernel-side method name.
    pub fn source_name(self) -> &'static str {
        match self {
            AtomicOp::Set => "atomicSet",
            AtomicOp::Get => "atomicGet",
            AtomicOp::Add => "atomicAdd",
            AtomicOp::Sub => "atomicSub",
            AtomicOp::Xchg => "atomicXchg",
            AtomicOp::Inc => "atomicInc",
            AtomicOp::Dec => "atomicDec",
            AtomicOp::CmpXchg => "atomicCmpXchg",
            AtomicOp::Min => "atomicMin",
            AtomicOp::Max => "atomicMax",
            AtomicOp::And => "atomicAnd",
            AtomicOp::Or => "atomicOr",
            AtomicOp::Xor => "atomicXor",
        }
    }

    /// OpenCL built-in implementing the operation at `width`.
    ///
    /// `Get` is a fetch-or with zero; `Set` is an exchange whose result
    /// the translator replaces with the stored value.
    pub fn cl_function(self, width: AtomicWidth) -> &'static str {
        let (int, long) = match self {
            AtomicOp::Set | AtomicOp::Xchg => ("atomic_xchg", "atom_xchg"),
            AtomicOp::Get | AtomicOp::Or => ("atomic_or", "atom_or"),
            AtomicOp::Add => ("atomic_add", "atom_add"),
            AtomicOp::Sub => ("atomic_sub", "atom_sub"),
            AtomicOp::Inc => ("atomic_inc", "atom_inc"),
            AtomicOp::Dec => ("atomic_dec", "atom_dec"),
            AtomicOp::CmpXchg => ("atomic_cmpxchg", "atom_cmpxchg"),
            AtomicOp::Min => ("atomic_min", "atom_min"),
            AtomicOp::Max => ("atomic_max", "atom_max"),
            AtomicOp::And => ("atomic_and", "atom_and"),
            AtomicOp::Xor => ("atomic_xor", "atom_xor"),
        };
        match width {
            AtomicWidth::Int => int,
            AtomicWidth::Long => long,
        }
    }

    /// Next slot value, or `None` when the operation leaves the slot
    /// unchanged. Operands are taken at `width`.
    pub fn next(self, current: i64, operands: &[i64], width: AtomicWidth) -> Option<i64> {
        let a = width.wrap(operands.first().copied().unwrap_or(0));
        let raw = match self {
            AtomicOp::Get => return None,
            AtomicOp::Set | AtomicOp::Xchg => a,
            AtomicOp::Add => current.wrapping_add(a),
            AtomicOp::Sub => current.wrapping_sub(a),
            AtomicOp::Inc => current.wrapping_add(1),
            AtomicOp::Dec => current.wrapping_sub(1),
            AtomicOp::CmpXchg => {
                if current != a {
                    return None;
                }
                operands.get(1).copied().unwrap_or(0)
            }
            AtomicOp::Min => {
                if a >= current {
                    return None;
                }
                a
            }
            AtomicOp::Max => {
                if a <= current {
                    return None;
                }
                a
            }
            AtomicOp::And => current & a,
            AtomicOp::Or => current | a,
            AtomicOp::Xor => current ^ a,
        };
        Some(width.wrap(raw))
    }
}

impl fmt::Display for AtomicOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source_name())
    }
}

// ─── Slots ─────────────────────────────────────────────────────────

/// One logical atomic integer, shared by every work-item that touches it.
#[derive(Debug)]
pub struct AtomicSlot {
    width: AtomicWidth,
    scope: MemoryScope,
    cell: AtomicI64,
}

impl AtomicSlot {
    pub fn new(width: AtomicWidth, scope: MemoryScope, value: i64) -> Self {
        Self {
            width,
            scope,
            cell: AtomicI64::new(width.wrap(value)),
        }
    }

    pub fn width(&self) -> AtomicWidth {
        self.width
    }

    pub fn scope(&self) -> MemoryScope {
        self.scope
    }

    pub fn load(&self) -> i64 {
        self.cell.load(Ordering::SeqCst)
    }

    pub fn store(&self, value: i64) {
        self.cell.store(self.width.wrap(value), Ordering::SeqCst);
    }

    /// Perform `op` indivisibly. Returns the value observed immediately
    /// before the operation (`Set` returns the value stored).
    pub fn apply(&self, op: AtomicOp, operands: &[i64]) -> i64 {
        if op == AtomicOp::Get {
            return self.load();
        }
        let mut current = self.cell.load(Ordering::Acquire);
        loop {
            let Some(next) = op.next(current, operands, self.width) else {
                return current;
            };
            match self
                .cell
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(old) => return if op == AtomicOp::Set { next } else { old },
                Err(actual) => current = actual,
            }
        }
    }
}

/// The slots backing one atomic field: one slot for a scalar atomic,
/// one per element for an atomic array.
#[derive(Debug)]
pub struct SlotArray {
    width: AtomicWidth,
    scope: MemoryScope,
    slots: Box<[AtomicSlot]>,
}

impl SlotArray {
    pub fn new(width: AtomicWidth, scope: MemoryScope, len: usize) -> Self {
        Self {
            width,
            scope,
            slots: (0..len).map(|_| AtomicSlot::new(width, scope, 0)).collect(),
        }
    }

    pub fn width(&self) -> AtomicWidth {
        self.width
    }

    pub fn scope(&self) -> MemoryScope {
        self.scope
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&AtomicSlot> {
        self.slots.get(index)
    }

    /// Host-side read of one slot.
    pub fn get(&self, index: usize) -> Option<i64> {
        self.slot(index).map(AtomicSlot::load)
    }

    /// Host-side write of one slot. Returns false if out of range.
    pub fn set(&self, index: usize, value: i64) -> bool {
        match self.slot(index) {
            Some(slot) => {
                slot.store(value);
                true
            }
            None => false,
        }
    }

    pub fn values(&self) -> Vec<i64> {
        self.slots.iter().map(AtomicSlot::load).collect()
    }

    pub(crate) fn restore(&self, values: &[i64]) {
        for (slot, v) in self.slots.iter().zip(values) {
            slot.store(*v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn run(op: AtomicOp, initial: i64, operands: &[i64]) -> (i64, i64) {
        let slot = AtomicSlot::new(AtomicWidth::Int, MemoryScope::Local, initial);
        let old = slot.apply(op, operands);
        (old, slot.load())
    }

    #[test]
    fn test_fetch_arithmetic() {
        assert_eq!(run(AtomicOp::Add, 10, &[20]), (10, 30));
        assert_eq!(run(AtomicOp::Sub, 10, &[20]), (10, -10));
        assert_eq!(run(AtomicOp::Xchg, 10, &[20]), (10, 20));
        assert_eq!(run(AtomicOp::Inc, 50, &[]), (50, 51));
        assert_eq!(run(AtomicOp::Dec, 50, &[]), (50, 49));
    }

    #[test]
    fn test_cmpxchg() {
        assert_eq!(run(AtomicOp::CmpXchg, 50, &[50, 100]), (50, 100));
        assert_eq!(run(AtomicOp::CmpXchg, 50, &[51, 100]), (50, 50));
    }

    #[test]
    fn test_min_max() {
        assert_eq!(run(AtomicOp::Min, 50, &[49]).1, 49);
        assert_eq!(run(AtomicOp::Min, 50, &[51]).1, 50);
        assert_eq!(run(AtomicOp::Max, 50, &[51]).1, 51);
        assert_eq!(run(AtomicOp::Max, 50, &[49]).1, 50);
    }

    #[test]
    fn test_bitwise() {
        assert_eq!(run(AtomicOp::And, 0xF1, &[0x8F]).1, 0x81);
        assert_eq!(run(AtomicOp::Or, 0x80, &[0x02]).1, 0x82);
        assert_eq!(run(AtomicOp::Xor, 0xF1, &[0x8F]).1, 0x7E);
    }

    #[test]
    fn test_set_and_get() {
        assert_eq!(run(AtomicOp::Set, 3, &[9]), (9, 9));
        assert_eq!(run(AtomicOp::Get, 3, &[]), (3, 3));
    }

    #[test]
    fn test_int_width_wraps() {
        assert_eq!(run(AtomicOp::Add, i32::MAX as i64, &[1]).1, i32::MIN as i64);
        let long = AtomicSlot::new(AtomicWidth::Long, MemoryScope::Global, i32::MAX as i64);
        long.apply(AtomicOp::Inc, &[]);
        assert_eq!(long.load(), i32::MAX as i64 + 1);
    }

    #[test]
    fn test_contended_increments_are_not_lost() {
        let slot = Arc::new(AtomicSlot::new(AtomicWidth::Int, MemoryScope::Global, 0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = slot.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        slot.apply(AtomicOp::Inc, &[]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(slot.load(), 8000);
    }

    #[test]
    fn test_cl_function_names() {
        assert_eq!(AtomicOp::Add.cl_function(AtomicWidth::Int), "atomic_add");
        assert_eq!(AtomicOp::Add.cl_function(AtomicWidth::Long), "atom_add");
        assert_eq!(AtomicOp::Get.cl_function(AtomicWidth::Int), "atomic_or");
    }

    #[test]
    fn test_slot_array_host_access() {
        let slots = SlotArray::new(AtomicWidth::Int, MemoryScope::Global, 2);
        assert!(slots.set(1, 7));
        assert!(!slots.set(2, 7));
        assert_eq!(slots.values(), vec![0, 7]);
    }
}
