//! Process-wide file descriptor reference counting.
//!
//! Handles duplicated without `DUP_FD` share one OS descriptor; the table
//! decides which close actually reaches the OS. The table is deliberately
//! process-global (not per-runtime-instance): a descriptor can outlive the
//! runtime instance that opened it in multi-instance embeddings, so the
//! backing storage must too.
//!
//! Growth is geometric in fd-space: `new_max = 16 + (fd & !15)`, i.e. room
//! for the requested fd rounded up to the next multiple of 16. Absent or
//! zero entries mean "not tracked".

use std::os::unix::io::RawFd;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

static FD_REFCNT: Lazy<Mutex<Vec<i32>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Must be called with the table lock held.
fn more_refcounted_fds(table: &mut Vec<i32>, fd: RawFd) {
    let old_max = table.len();
    let new_max = 16 + (fd as usize & !15);
    if (fd as usize) < old_max {
        return;
    }
    log::trace!("fdtable: grow old={} need={} new={}", old_max, fd, new_max);
    table.resize(new_max, 0);
}

/// Increment the reference count for `fd`, tracking it if new.
///
/// # Panics
///
/// On a negative fd or a count that was already corrupt; both indicate a
/// core-logic bug, not a runtime condition.
pub fn refcnt_inc(fd: RawFd) {
    assert!(fd >= 0, "refcnt_inc: fd {} < 0", fd);
    let mut table = FD_REFCNT.lock();
    if fd as usize >= table.len() {
        more_refcounted_fds(&mut table, fd);
    }
    table[fd as usize] += 1;
    assert!(
        table[fd as usize] > 0,
        "refcnt_inc: fd {}: {} <= 0",
        fd,
        table[fd as usize]
    );
    log::trace!("fdtable: inc fd {} refcnt={}", fd, table[fd as usize]);
}

/// Decrement the reference count for `fd` and return the remaining count.
/// A return of 0 means the caller owns the real OS close.
///
/// # Panics
///
/// On underflow, a negative fd, or an fd that was never tracked.
pub fn refcnt_dec(fd: RawFd) -> i32 {
    assert!(fd >= 0, "refcnt_dec: fd {} < 0", fd);
    let mut table = FD_REFCNT.lock();
    assert!(
        (fd as usize) < table.len(),
        "refcnt_dec: fd {} >= table size {}",
        fd,
        table.len()
    );
    assert!(
        table[fd as usize] > 0,
        "refcnt_dec: fd {}: {} <= 0",
        fd,
        table[fd as usize]
    );
    table[fd as usize] -= 1;
    let cnt = table[fd as usize];
    log::trace!("fdtable: dec fd {} refcnt={}", fd, cnt);
    cnt
}

/// Current reference count for `fd`; 0 for untracked descriptors.
pub fn refcnt(fd: RawFd) -> i32 {
    assert!(fd >= 0, "refcnt: fd {} < 0", fd);
    let table = FD_REFCNT.lock();
    table.get(fd as usize).copied().unwrap_or(0)
}

/// RAII bracket around `fork(2)`.
///
/// Holding the guard pins the fd table: no other thread can be mid-mutation
/// when the process image is duplicated, so the child inherits a consistent
/// table and an unlocked mutex. The lock is released in both parent and
/// child when the guard drops; the child must not re-initialize the table.
pub struct ForkBracket<'a> {
    _guard: MutexGuard<'a, Vec<i32>>,
}

impl ForkBracket<'_> {
    /// Acquire the pre-fork lock.
    pub fn acquire() -> ForkBracket<'static> {
        ForkBracket {
            _guard: FD_REFCNT.lock(),
        }
    }

    /// Fork while the table is pinned. Returns the child pid in the parent
    /// and 0 in the child, or -1 on failure with errno set.
    ///
    /// # Safety
    ///
    /// Same contract as `fork(2)` in a multithreaded process: only
    /// async-signal-safe work may happen in the child before exec, beyond
    /// using the inherited fd table.
    pub unsafe fn fork(&self) -> libc::pid_t {
        libc::fork()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_rounds_up_in_sixteens() {
        // Use a high fd so this test does not collide with real descriptors
        // tracked by other tests.
        let fd = 900;
        refcnt_inc(fd);
        assert_eq!(refcnt(fd), 1);
        refcnt_inc(fd);
        assert_eq!(refcnt(fd), 2);
        assert_eq!(refcnt_dec(fd), 1);
        assert_eq!(refcnt_dec(fd), 0);
        assert_eq!(refcnt(fd), 0);
    }

    #[test]
    fn untracked_fd_reads_zero() {
        assert_eq!(refcnt(987), 0);
    }

    #[test]
    #[should_panic(expected = "refcnt_dec")]
    fn underflow_is_fatal() {
        refcnt_dec(995);
    }
}
