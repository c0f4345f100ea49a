//! Host arrays bound to kernel fields.
//!
//! A [`Buffer`] is a shared handle: cloning it shares the storage, so the
//! host keeps one handle and reads results back after `execute`. Cells
//! are relaxed atomics, which keeps concurrent work-item access sound on
//! the Rust side; racing non-atomic writes to one element stay a race at
//! the kernel level, as they would on a device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::ir::{ScalarType, Value};

/// A Rust type that maps onto one kernel scalar type.
pub trait Element: Copy {
    const TYPE: ScalarType;
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Self;
}

macro_rules! element {
    ($t:ty, $variant:ident, $scalar:ident) => {
        impl Element for $t {
            const TYPE: ScalarType = ScalarType::$scalar;

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: Value) -> Self {
                match value.cast(ScalarType::$scalar) {
                    Value::$variant(v) => v,
                    _ => Default::default(),
                }
            }
        }
    };
}

element!(bool, Boolean, Boolean);
element!(i8, Byte, Byte);
element!(i16, Short, Short);
element!(u16, Char, Char);
element!(i32, Int, Int);
element!(i64, Long, Long);
element!(f32, Float, Float);
element!(f64, Double, Double);

#[derive(Debug)]
struct Storage {
    ty: ScalarType,
    cells: Box<[AtomicU64]>,
}

#[derive(Clone, Debug)]
pub struct Buffer {
    inner: Arc<Storage>,
}

impl Buffer {
    pub fn zeroed(ty: ScalarType, len: usize) -> Self {
        let zero = Value::zero(ty).to_bits();
        Self {
            inner: Arc::new(Storage {
                ty,
                cells: (0..len).map(|_| AtomicU64::new(zero)).collect(),
            }),
        }
    }

    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        Self {
            inner: Arc::new(Storage {
                ty: T::TYPE,
                cells: data
                    .iter()
                    .map(|v| AtomicU64::new(v.into_value().to_bits()))
                    .collect(),
            }),
        }
    }

    /// Build from values, all of which must have type `ty`.
    pub fn from_values(ty: ScalarType, values: &[Value]) -> Result<Self> {
        if let Some(v) = values.iter().find(|v| v.ty() != ty) {
            return Err(KernelError::binding(format!(
                "{} value {} in a {} buffer",
                v.ty().name(),
                v,
                ty.name()
            )));
        }
        let buffer = Self::zeroed(ty, values.len());
        for (i, v) in values.iter().enumerate() {
            buffer.store(i, *v);
        }
        Ok(buffer)
    }

    pub fn element_type(&self) -> ScalarType {
        self.inner.ty
    }

    pub fn len(&self) -> usize {
        self.inner.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cells.is_empty()
    }

    /// Whether two handles share storage.
    pub fn same_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn load(&self, index: usize) -> Option<Value> {
        self.inner
            .cells
            .get(index)
            .map(|c| Value::from_bits(self.inner.ty, c.load(Ordering::Relaxed)))
    }

    /// Store `value` converted to the element type. Returns false if
    /// `index` is out of range.
    pub fn store(&self, index: usize, value: Value) -> bool {
        match self.inner.cells.get(index) {
            Some(cell) => {
                cell.store(value.cast(self.inner.ty).to_bits(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn values(&self) -> Vec<Value> {
        (0..self.len()).filter_map(|i| self.load(i)).collect()
    }

    /// Contents as `T`, which must match the element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::TYPE != self.inner.ty {
            return Err(KernelError::binding(format!(
                "cannot read a {} buffer as {}",
                self.inner.ty.name(),
                T::TYPE.name()
            )));
        }
        Ok(self.values().into_iter().map(T::from_value).collect())
    }

    /// Overwrite the contents from `data`, which must have the same
    /// length and element type.
    pub fn copy_from<T: Element>(&self, data: &[T]) -> Result<()> {
        if T::TYPE != self.inner.ty || data.len() != self.len() {
            return Err(KernelError::binding(format!(
                "cannot copy {} {} values into a {} buffer of length {}",
                data.len(),
                T::TYPE.name(),
                self.inner.ty.name(),
                self.len()
            )));
        }
        for (i, v) in data.iter().enumerate() {
            self.store(i, v.into_value());
        }
        Ok(())
    }

    /// Byte size of the contents in device layout.
    pub fn byte_len(&self) -> usize {
        self.len() * self.inner.ty.size_bytes()
    }

    /// Little-endian device image of the contents.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let width = self.inner.ty.size_bytes();
        let mut out = Vec::with_capacity(self.byte_len());
        for cell in self.inner.cells.iter() {
            let bits = cell.load(Ordering::Relaxed);
            out.extend_from_slice(&bits.to_le_bytes()[..width]);
        }
        out
    }

    /// Replace the contents from a little-endian device image.
    pub fn copy_from_le_bytes(&self, bytes: &[u8]) -> Result<()> {
        let width = self.inner.ty.size_bytes();
        if bytes.len() != self.byte_len() {
            return Err(KernelError::binding(format!(
                "device image of {} bytes for a buffer of {} bytes",
                bytes.len(),
                self.byte_len()
            )));
        }
        for (cell, chunk) in self.inner.cells.iter().zip(bytes.chunks_exact(width)) {
            let mut raw = [0u8; 8];
            raw[..width].copy_from_slice(chunk);
            let value = Value::from_bits(self.inner.ty, u64::from_le_bytes(raw));
            cell.store(value.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Vec<u64> {
        self.inner
            .cells
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    pub(crate) fn restore(&self, bits: &[u64]) {
        for (cell, b) in self.inner.cells.iter().zip(bits) {
            cell.store(*b, Ordering::Relaxed);
        }
    }
}

impl<T: Element> From<Vec<T>> for Buffer {
    fn from(data: Vec<T>) -> Self {
        Buffer::from_slice(&data)
    }
}
