//! Accelerator collaborator interface.
//!
//! The crate does not link a driver. An [`Accelerator`] implementation
//! (an OpenCL binding, a test double) turns kernel source into a
//! [`Program`]; the dispatcher owns transfers and argument marshalling.
//! Launch arguments follow [`kernel_params`] exactly, so the argument
//! list always agrees with the `__kernel` signature.

use std::sync::Arc;

use crate::atomic::{AtomicWidth, MemoryScope, SlotArray};
use crate::codegen::{kernel_params, KernelParam, KernelSource};
use crate::ir::Value;
use crate::schema::KernelDescriptor;

use super::range::Range;
use super::Bound;

/// One argument of a kernel launch.
#[derive(Clone, Debug, PartialEq)]
pub enum LaunchArg {
    /// Device buffer of this many bytes, already uploaded.
    Buffer { bytes: usize },
    /// Work-group local scratch of this many bytes.
    Local { bytes: usize },
    Scalar(Value),
}

/// A built kernel on a device.
///
/// `arg` indices are positions in the launch argument list.
pub trait Program: Send + Sync {
    fn upload(&self, arg: usize, bytes: &[u8]) -> Result<(), String>;
    fn download(&self, arg: usize) -> Result<Vec<u8>, String>;
    fn launch(&self, args: &[LaunchArg], range: &Range, local: [usize; 3]) -> Result<(), String>;
}

pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;
    fn build(&self, source: &KernelSource) -> Result<Arc<dyn Program>, String>;
}

/// Device image of atomic slots: one `int` or `long` per slot.
pub(crate) fn slots_to_le_bytes(slots: &SlotArray) -> Vec<u8> {
    let mut out = Vec::with_capacity(slots.len() * 8);
    for v in slots.values() {
        match slots.width() {
            AtomicWidth::Int => out.extend_from_slice(&(v as i32).to_le_bytes()),
            AtomicWidth::Long => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
    out
}

pub(crate) fn slots_from_le_bytes(slots: &SlotArray, bytes: &[u8]) -> Result<(), String> {
    let width = (slots.width().bits() / 8) as usize;
    if bytes.len() != slots.len() * width {
        return Err(format!(
            "device image of {} bytes for {} atomic slots",
            bytes.len(),
            slots.len()
        ));
    }
    for (i, chunk) in bytes.chunks_exact(width).enumerate() {
        let v = match slots.width() {
            AtomicWidth::Int => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(chunk);
                i32::from_le_bytes(raw) as i64
            }
            AtomicWidth::Long => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                i64::from_le_bytes(raw)
            }
        };
        slots.set(i, v);
    }
    Ok(())
}

/// Whether a bound field lives in host-visible device memory and moves
/// through `upload`/`download`.
pub(crate) fn is_transferred(descriptor: &KernelDescriptor, field: usize) -> bool {
    let f = &descriptor.fields()[field];
    (f.is_array() || f.is_atomic()) && f.scope() == MemoryScope::Global
}

/// Launch arguments in parameter order, paired with the field each one
/// carries (`None` for lengths and `passid`).
pub(crate) fn launch_args(
    descriptor: &KernelDescriptor,
    bound: &[Bound],
    pass_id: i32,
) -> Vec<(LaunchArg, Option<usize>)> {
    kernel_params(descriptor)
        .into_iter()
        .map(|param| match param {
            KernelParam::Field(i) => {
                let arg = match &bound[i] {
                    Bound::Scalar(v) => LaunchArg::Scalar(*v),
                    Bound::Array(b) if is_transferred(descriptor, i) => {
                        LaunchArg::Buffer { bytes: b.byte_len() }
                    }
                    Bound::Array(b) => LaunchArg::Local { bytes: b.byte_len() },
                    Bound::Slots(s) => {
                        let bytes = s.len() * (s.width().bits() / 8) as usize;
                        if is_transferred(descriptor, i) {
                            LaunchArg::Buffer { bytes }
                        } else {
                            LaunchArg::Local { bytes }
                        }
                    }
                };
                (arg, Some(i))
            }
            KernelParam::Length(i) => {
                let len = match &bound[i] {
                    Bound::Array(b) => b.len(),
                    Bound::Slots(s) => s.len(),
                    Bound::Scalar(_) => 1,
                };
                (LaunchArg::Scalar(Value::Int(len as i32)), None)
            }
            KernelParam::PassId => (LaunchArg::Scalar(Value::Int(pass_id)), None),
        })
        .collect()
}

/// Position of `field`'s argument in the launch list.
pub(crate) fn arg_index(descriptor: &KernelDescriptor, field: usize) -> Option<usize> {
    kernel_params(descriptor)
        .iter()
        .position(|p| *p == KernelParam::Field(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_device_image() {
        let slots = SlotArray::new(AtomicWidth::Int, MemoryScope::Global, 2);
        slots.set(0, -1);
        slots.set(1, 7);
        let bytes = slots_to_le_bytes(&slots);
        assert_eq!(bytes, vec![0xFF, 0xFF, 0xFF, 0xFF, 7, 0, 0, 0]);
        slots.set(0, 0);
        slots_from_le_bytes(&slots, &bytes).unwrap();
        assert_eq!(slots.values(), vec![-1, 7]);
        assert!(slots_from_le_bytes(&slots, &bytes[..3]).is_err());
    }
}
