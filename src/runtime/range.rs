//! Execution ranges.

use crate::error::{KernelError, Result};

/// An N-dimensional index space, `1..=3` dimensions.
///
/// Identical for both backends. The local (work-group) size is optional;
/// when absent, [`Range::local_sizes`] derives one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Range {
    dims: usize,
    global: [usize; 3],
    local: Option<Vec<usize>>,
}

impl Range {
    pub fn one_d(x: usize) -> Self {
        Self {
            dims: 1,
            global: [x, 1, 1],
            local: None,
        }
    }

    pub fn two_d(x: usize, y: usize) -> Self {
        Self {
            dims: 2,
            global: [x, y, 1],
            local: None,
        }
    }

    pub fn three_d(x: usize, y: usize, z: usize) -> Self {
        Self {
            dims: 3,
            global: [x, y, z],
            local: None,
        }
    }

    /// Build from a list of global sizes, one per dimension.
    pub fn from_sizes(global: &[usize]) -> Result<Self> {
        match *global {
            [x] => Ok(Self::one_d(x)),
            [x, y] => Ok(Self::two_d(x, y)),
            [x, y, z] => Ok(Self::three_d(x, y, z)),
            _ => Err(KernelError::range(format!(
                "{} dimensions requested, expected 1 to 3",
                global.len()
            ))),
        }
    }

    /// Explicit work-group size, one entry per dimension.
    pub fn with_local(mut self, local: &[usize]) -> Self {
        self.local = Some(local.to_vec());
        self
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Global size in dimension `d`; `1` beyond the range's dimensions.
    pub fn global_size(&self, d: usize) -> usize {
        self.global.get(d).copied().unwrap_or(1)
    }

    pub fn global_sizes(&self) -> &[usize] {
        &self.global[..self.dims]
    }

    /// Total number of work-items, or `None` if it overflows `usize`.
    pub fn checked_work_items(&self) -> Option<usize> {
        self.global.iter().try_fold(1usize, |n, &g| n.checked_mul(g))
    }

    /// Total number of work-items. Saturates; [`Range::local_sizes`]
    /// rejects ranges whose size overflows.
    pub fn work_items(&self) -> usize {
        self.checked_work_items().unwrap_or(usize::MAX)
    }

    /// Check the range and resolve its work-group size against
    /// `max_work_group_size`. The result is padded with `1` to three
    /// dimensions.
    pub fn local_sizes(&self, max_work_group_size: usize) -> Result<[usize; 3]> {
        if !(1..=3).contains(&self.dims) {
            return Err(KernelError::range(format!("{} dimensions", self.dims)));
        }
        if let Some(d) = self.global_sizes().iter().position(|&g| g == 0) {
            return Err(KernelError::range(format!("global size of dimension {} is 0", d)));
        }
        if self.checked_work_items().is_none() {
            return Err(KernelError::range(format!("{} work-items overflow the index space", self)));
        }
        let local = match &self.local {
            Some(local) => {
                if local.len() != self.dims {
                    return Err(KernelError::range(format!(
                        "{} local sizes for a {}D range",
                        local.len(),
                        self.dims
                    )));
                }
                let mut out = [1; 3];
                for (d, &l) in local.iter().enumerate() {
                    if l == 0 || self.global[d] % l != 0 {
                        return Err(KernelError::range(format!(
                            "local size {} does not divide global size {} in dimension {}",
                            l, self.global[d], d
                        )));
                    }
                    out[d] = l;
                }
                out
            }
            None => self.default_local(max_work_group_size),
        };
        let product: usize = local.iter().product();
        if product > max_work_group_size {
            return Err(KernelError::range(format!(
                "work-group of {} items exceeds the maximum of {}",
                product, max_work_group_size
            )));
        }
        Ok(local)
    }

    /// Largest divisor of each global size that keeps the product within
    /// the budget, filling dimension 0 first.
    fn default_local(&self, max_work_group_size: usize) -> [usize; 3] {
        let mut out = [1; 3];
        let mut budget = max_work_group_size.max(1);
        for d in 0..self.dims {
            let g = self.global[d];
            let pick = (1..=g.min(budget)).rev().find(|l| g % l == 0).unwrap_or(1);
            out[d] = pick;
            budget /= pick;
        }
        out
    }

    /// Global coordinates of a flattened index; dimension 0 varies
    /// fastest.
    pub fn coords(&self, flat: usize) -> [usize; 3] {
        let [x, y, _] = self.global;
        [flat % x, (flat / x) % y, flat / (x * y)]
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sizes: Vec<String> = self.global_sizes().iter().map(|s| s.to_string()).collect();
        write!(f, "{}", sizes.join("x"))?;
        if let Some(local) = &self.local {
            let local: Vec<String> = local.iter().map(|s| s.to_string()).collect();
            write!(f, " / {}", local.join("x"))?;
        }
        Ok(())
    }
}
