//! Shared flags with a single writer, and busy guards for periodic
//! operations.
//!
//! The Feed Controller owns the mixing flag and the Measurement Controller
//! owns the supply permission; each side only hands the other a
//! [`FlagReader`]. Long-running periodic operations hold a [`BusyGuard`]
//! permit for their whole body, so a tick that arrives while one is in
//! progress is dropped and the permit is released on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

// ---------------------------------------------------------------------------
// Single-writer flag
// ---------------------------------------------------------------------------

/// The writing half; there is exactly one per flag.
#[derive(Debug)]
pub struct SharedFlag {
    cell: Arc<AtomicBool>,
}

/// Read-only view handed to other components.
#[derive(Debug, Clone)]
pub struct FlagReader {
    cell: Arc<AtomicBool>,
}

impl SharedFlag {
    pub fn new(initial: bool) -> Self {
        Self {
            cell: Arc::new(AtomicBool::new(initial)),
        }
    }

    pub fn get(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }

    /// Store `value`; returns true when the stored value changed.
    pub fn set(&self, value: bool) -> bool {
        self.cell.swap(value, Ordering::SeqCst) != value
    }

    pub fn reader(&self) -> FlagReader {
        FlagReader {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl FlagReader {
    pub fn get(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Busy guard
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BusyGuard {
    permit: Semaphore,
}

impl Default for BusyGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl BusyGuard {
    pub fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
        }
    }

    /// `None` when another invocation still holds the guard.
    pub fn try_enter(&self) -> Option<SemaphorePermit<'_>> {
        self.permit.try_acquire().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }
}

// ===========================================================================
// Tests
// ===========================================================================
