//! Growable byte buffers and the global buffered-byte budget.
//!
//! A [`Buffer`] grows by doubling. It can be used in two modes:
//! - infallible: [`Buffer::extend`] grows like a `Vec` and aborts on OOM
//! - charged: [`Buffer::try_extend`] charges every growth step against a
//!   shared [`BufferBudget`] and reports failure instead of aborting
//!
//! Charges are held by [`Charge`] guards, so the budget is credited back
//! whenever the memory they account for is dropped. A charged buffer may
//! commit more than it allocates up front; growth inside the commitment
//! charges nothing further, so a buffer admitted with its final size
//! committed cannot run out of budget later.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::usage_error;

/// Error returned when a charged buffer cannot grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Growing would push the budget past its limit.
    BudgetExhausted,
    /// The allocator refused the allocation.
    AllocFailed,
    /// The data would not fit in the maximum capacity given.
    CapacityExceeded,
}

/// Global count of bytes held by charged buffers, with a hard limit.
#[derive(Debug)]
pub struct BufferBudget {
    used: AtomicUsize,
    limit: usize,
}

impl BufferBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    /// Bytes currently charged.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Charge `amount` bytes, or return `None` if that would pass the limit.
    pub fn try_charge(self: &Arc<Self>, amount: usize) -> Option<Charge> {
        self.reserve(amount).then(|| Charge {
            budget: Arc::clone(self),
            amount,
        })
    }

    fn reserve(&self, amount: usize) -> bool {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let Some(next) = used.checked_add(amount).filter(|n| *n <= self.limit) else {
                return false;
            };
            match self
                .used
                .compare_exchange_weak(used, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    fn release(&self, amount: usize) {
        let prev = self.used.fetch_sub(amount, Ordering::AcqRel);
        if prev < amount {
            usage_error("buffer budget released more bytes than were charged");
        }
    }
}

/// Bytes charged against a [`BufferBudget`]; credited back on drop.
#[derive(Debug)]
pub struct Charge {
    budget: Arc<BufferBudget>,
    amount: usize,
}

impl Charge {
    /// Bytes needed on top of this charge to cover `target`.
    fn shortfall(&self, target: usize) -> usize {
        target.saturating_sub(self.amount)
    }

    fn try_grow(&mut self, extra: usize) -> Result<(), BufferError> {
        if !self.budget.reserve(extra) {
            return Err(BufferError::BudgetExhausted);
        }
        self.amount += extra;
        Ok(())
    }

    fn shrink(&mut self, by: usize) {
        self.budget.release(by);
        self.amount -= by;
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        if self.amount > 0 {
            self.budget.release(self.amount);
        }
    }
}

/// Growable byte buffer with doubling growth.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    /// Capacity allocated; never more than the charge, if any.
    reserved: usize,
    charge: Option<Charge>,
}

impl Buffer {
    /// Empty buffer allocating `capacity` bytes, with `commit` bytes (at
    /// least `capacity`) charged against `budget` up front.
    pub fn charged(
        budget: &Arc<BufferBudget>,
        commit: usize,
        capacity: usize,
    ) -> Result<Self, BufferError> {
        let charge = budget
            .try_charge(commit.max(capacity))
            .ok_or(BufferError::BudgetExhausted)?;
        let mut data = Vec::new();
        // on failure the charge drops here and is credited back
        data.try_reserve_exact(capacity)
            .map_err(|_| BufferError::AllocFailed)?;
        Ok(Self {
            data,
            reserved: capacity,
            charge: Some(charge),
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.reserved
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append, doubling capacity as needed. Never fails; running out of
    /// memory aborts the process.
    pub fn extend(&mut self, data: &[u8]) {
        let needed = self.data.len() + data.len();
        if needed > self.reserved {
            let target = needed.max(self.reserved.saturating_mul(2));
            self.data.reserve_exact(target - self.data.len());
            if let Some(charge) = self.charge.as_mut() {
                // infallible mode may overshoot the limit
                let extra = charge.shortfall(target);
                charge.budget.used.fetch_add(extra, Ordering::AcqRel);
                charge.amount += extra;
            }
            self.reserved = target;
        }
        self.data.extend_from_slice(data);
    }

    /// Append without ever exceeding `max_capacity` bytes of storage.
    ///
    /// Growth doubles the capacity, clamped to `max_capacity`. For a charged
    /// buffer, growth past the committed amount is charged before it is
    /// allocated and credited back if the allocation fails. On error the
    /// buffer is unchanged.
    pub fn try_extend(&mut self, data: &[u8], max_capacity: usize) -> Result<(), BufferError> {
        let needed = self
            .data
            .len()
            .checked_add(data.len())
            .filter(|n| *n <= max_capacity)
            .ok_or(BufferError::CapacityExceeded)?;

        if needed > self.reserved {
            let target = needed
                .max(self.reserved.saturating_mul(2))
                .min(max_capacity);
            let mut extra = 0;
            if let Some(charge) = self.charge.as_mut() {
                extra = charge.shortfall(target);
                charge.try_grow(extra)?;
            }
            if self.data.try_reserve_exact(target - self.data.len()).is_err() {
                if let Some(charge) = self.charge.as_mut() {
                    charge.shrink(extra);
                }
                return Err(BufferError::AllocFailed);
            }
            self.reserved = target;
        }

        self.data.extend_from_slice(data);
        Ok(())
    }

    /// Take the contents, keeping the charge alive alongside them.
    pub fn freeze(self) -> (Bytes, Option<Charge>) {
        (Bytes::from(self.data), self.charge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_charge_and_release() {
        let budget = Arc::new(BufferBudget::new(100));

        let a = budget.try_charge(60).unwrap();
        assert_eq!(budget.used(), 60);
        assert!(budget.try_charge(41).is_none());
        assert_eq!(budget.used(), 60);

        let b = budget.try_charge(40).unwrap();
        assert_eq!(budget.used(), 100);

        drop(a);
        assert_eq!(budget.used(), 40);
        drop(b);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_charged_buffer_doubles_within_max() {
        let budget = Arc::new(BufferBudget::new(10_000));
        let mut buf = Buffer::charged(&budget, 100, 100).unwrap();
        assert_eq!(budget.used(), 100);

        buf.try_extend(&[1u8; 100], 1000).unwrap();
        assert_eq!(buf.capacity(), 100);

        // 101 bytes needs growth: doubles to 200
        buf.try_extend(&[2u8], 1000).unwrap();
        assert_eq!(buf.capacity(), 200);
        assert_eq!(budget.used(), 200);

        // doubling is clamped to the maximum
        buf.try_extend(&[3u8; 400], 1000).unwrap();
        assert_eq!(buf.capacity(), 501);
        buf.try_extend(&[4u8; 499], 1000).unwrap();
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.capacity(), 1000);
        assert_eq!(budget.used(), 1000);

        drop(buf);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_capacity_exceeded_leaves_buffer_unchanged() {
        let budget = Arc::new(BufferBudget::new(10_000));
        let mut buf = Buffer::charged(&budget, 8, 8).unwrap();
        buf.try_extend(b"12345678", 10).unwrap();

        assert_eq!(
            buf.try_extend(b"abc", 10),
            Err(BufferError::CapacityExceeded)
        );
        assert_eq!(buf.as_slice(), b"12345678");
        assert_eq!(budget.used(), 8);
    }

    #[test]
    fn test_budget_exhausted_on_growth() {
        let budget = Arc::new(BufferBudget::new(150));
        let mut buf = Buffer::charged(&budget, 100, 100).unwrap();
        buf.try_extend(&[0u8; 100], 1000).unwrap();

        // growth to 200 would need 100 more; only 50 left
        assert_eq!(
            buf.try_extend(&[0u8; 10], 1000),
            Err(BufferError::BudgetExhausted)
        );
        assert_eq!(buf.len(), 100);
        assert_eq!(budget.used(), 100);
    }

    #[test]
    fn test_charged_fails_over_budget() {
        let budget = Arc::new(BufferBudget::new(10));
        assert_eq!(
            Buffer::charged(&budget, 11, 4).unwrap_err(),
            BufferError::BudgetExhausted
        );
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_freeze_keeps_charge() {
        let budget = Arc::new(BufferBudget::new(1000));
        let mut buf = Buffer::charged(&budget, 16, 16).unwrap();
        buf.try_extend(b"hello", 16).unwrap();

        let (bytes, charge) = buf.freeze();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(budget.used(), 16);

        drop(charge);
        assert_eq!(budget.used(), 0);
        assert_eq!(&bytes[..], b"hello");
    }

    #[test]
    fn test_uncharged_extend() {
        let mut buf = Buffer::default();
        for chunk in [&b"ab"[..], b"cde", b"", b"fghij"] {
            buf.extend(chunk);
        }
        assert_eq!(buf.as_slice(), b"abcdefghij");
        assert!(buf.capacity() >= 10);
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_commitment_covers_growth() {
        let budget = Arc::new(BufferBudget::new(1000));
        let mut buf = Buffer::charged(&budget, 600, 64).unwrap();
        assert_eq!(buf.capacity(), 64);
        assert_eq!(budget.used(), 600);

        // another buffer cannot take the committed room
        assert_eq!(
            Buffer::charged(&budget, 600, 64).unwrap_err(),
            BufferError::BudgetExhausted
        );

        for _ in 0..6 {
            buf.try_extend(&[7u8; 100], 600).unwrap();
        }
        assert_eq!(buf.len(), 600);
        assert_eq!(buf.capacity(), 600);
        assert_eq!(budget.used(), 600);

        drop(buf);
        assert_eq!(budget.used(), 0);
    }
}
