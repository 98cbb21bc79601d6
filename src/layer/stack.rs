//! The per-handle layer stack.
//!
//! A stack is a vector of slots, top at the end. Operations dispatch
//! through the slot's [`LayerDef`] and may recurse into the layers below.
//! Structural mutation during a dispatched operation is safe because slot
//! removal is deferred whenever the stack is busy or an instance holds a
//! lock count: `pop` then only marks the slot CLEARED (def pointer gone,
//! flags reduced to `F_CLEARED`) and a sweep reclaims cleared slots once
//! the stack goes quiescent. That keeps slot indices stable for every
//! frame currently executing against the stack.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{last_errno, set_errno};
use crate::hooks;

use super::buffer::BufState;
use super::{base_binmode, base_close, base_clearerr, base_eof, base_error, base_fileno, base_popped, base_pushed, base_read, base_unread};
use super::{LayerDef, LayerState, F_CLEARED};

const CTL_CLOSE_REQUESTED: u32 = 0x1;

/// State shared between a handle and async-check callbacks, outliving
/// neither: callbacks hold only a [`HandleToken`] (a weak reference) and
/// communicate through atomic control bits, never through a raw pointer
/// into the stack.
pub struct HandleShared {
    control: AtomicU32,
}

impl HandleShared {
    fn new() -> Arc<HandleShared> {
        Arc::new(HandleShared {
            control: AtomicU32::new(0),
        })
    }

    fn take_close_request(&self) -> bool {
        self.control.fetch_and(!CTL_CLOSE_REQUESTED, Ordering::AcqRel) & CTL_CLOSE_REQUESTED != 0
    }
}

/// Weak reference to a live handle, given to the async-check callback.
#[derive(Clone)]
pub struct HandleToken(Weak<HandleShared>);

impl HandleToken {
    /// Ask the interrupted operation to tear the handle down before
    /// retrying. Returns false if the handle is already gone.
    pub fn request_close(&self) -> bool {
        match self.0.upgrade() {
            Some(shared) => {
                shared.control.fetch_or(CTL_CLOSE_REQUESTED, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Whether the handle still exists.
    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// One layer instance: its definition (None once CLEARED), mutable flags
/// word, saved errno, external lock count, and private state.
pub struct LayerSlot {
    pub def: Option<&'static LayerDef>,
    pub flags: u32,
    pub err: i32,
    pub lock: u32,
    pub state: LayerState,
}

/// The stack of layer instances behind one handle.
pub struct LayerStack {
    slots: Vec<LayerSlot>,
    /// Operation re-entrancy depth. Nonzero pins slot indices: pops are
    /// deferred to CLEARED marking until the stack is quiescent.
    busy: u32,
    shared: Arc<HandleShared>,
}

impl Default for LayerStack {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerStack {
    pub fn new() -> LayerStack {
        LayerStack {
            slots: Vec::new(),
            busy: 0,
            shared: HandleShared::new(),
        }
    }

    /// Token for the async-check callback.
    pub fn token(&self) -> HandleToken {
        HandleToken(Arc::downgrade(&self.shared))
    }

    pub(crate) fn slot(&self, i: usize) -> &LayerSlot {
        &self.slots[i]
    }

    pub(crate) fn slot_mut(&mut self, i: usize) -> &mut LayerSlot {
        &mut self.slots[i]
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Index of the topmost live (non-CLEARED) slot.
    pub fn top_index(&self) -> Option<usize> {
        (0..self.slots.len()).rev().find(|&i| self.slots[i].def.is_some())
    }

    /// Index of the next live slot below `i`.
    pub fn next_below(&self, i: usize) -> Option<usize> {
        (0..i).rev().find(|&j| self.slots[j].def.is_some())
    }

    /// A handle is valid iff it has a live top layer.
    pub fn is_valid(&self) -> bool {
        self.top_index().is_some()
    }

    /// Names of the live layers, top first.
    pub fn layer_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut i = self.top_index();
        while let Some(j) = i {
            if let Some(def) = self.slots[j].def {
                names.push(def.name);
            }
            i = self.next_below(j);
        }
        names
    }

    pub(crate) fn enter(&mut self) {
        self.busy += 1;
    }

    pub(crate) fn leave(&mut self) {
        debug_assert!(self.busy > 0);
        self.busy -= 1;
        if self.busy == 0 {
            self.sweep();
        }
    }

    /// Reclaim CLEARED slots nobody holds a lock on. Only runs when the
    /// stack is quiescent so live indices never shift under an operation.
    pub(crate) fn sweep(&mut self) {
        if self.busy == 0 {
            self.slots.retain(|s| s.def.is_some() || s.lock > 0);
        }
    }

    pub(crate) fn save_errno(&mut self, i: usize) {
        self.slots[i].err = last_errno();
    }

    pub(crate) fn saved_errno(&self, i: usize) -> i32 {
        self.slots[i].err
    }

    // -----------------------------------------------------------------
    // push / pop
    // -----------------------------------------------------------------

    /// Push `def` on top of the stack. Returns 0 on success, -1 when the
    /// layer's `pushed` hook rejected the mode (the slot is popped again).
    ///
    /// # Panics
    ///
    /// If `def.size` does not match the compiled size of the state its
    /// constructor produces; that is a bug in the layer definition.
    pub fn push(&mut self, def: &'static LayerDef, mode: Option<&str>, arg: Option<&str>) -> i32 {
        let at = self.slots.len();
        self.push_slot_at(at, def, mode, arg)
    }

    /// Push `def` directly above slot `i` (used by unread staging).
    /// Returns the new slot's index.
    pub(crate) fn push_above(
        &mut self,
        i: usize,
        def: &'static LayerDef,
        mode: Option<&str>,
        arg: Option<&str>,
    ) -> Option<usize> {
        let at = i + 1;
        if self.push_slot_at(at, def, mode, arg) == 0 {
            Some(at)
        } else {
            None
        }
    }

    fn push_slot_at(
        &mut self,
        at: usize,
        def: &'static LayerDef,
        mode: Option<&str>,
        arg: Option<&str>,
    ) -> i32 {
        log::debug!(
            "push {} at {} mode={:?}",
            def.name,
            at,
            mode
        );
        if def.size != 0 {
            let state = match def.mk_state {
                Some(mk) => mk(),
                None => LayerState::None,
            };
            assert!(
                state.size() == def.size,
                "layer \"{}\" state size ({}) does not match size declared by its definition ({})",
                def.name,
                state.size(),
                def.size
            );
            self.slots.insert(
                at,
                LayerSlot {
                    def: Some(def),
                    flags: 0,
                    err: 0,
                    lock: 0,
                    state,
                },
            );
            let pushed = def.pushed.unwrap_or(base_pushed);
            if pushed(self, at, mode, arg) != 0 {
                self.pop_at(at);
                return -1;
            }
            0
        } else {
            // Pseudo layer: no slot, the hook does its own stack mutation
            // against the current top.
            let top = match self.top_index() {
                Some(top) => top,
                None => {
                    set_errno(libc::EBADF);
                    return -1;
                }
            };
            match def.pushed {
                Some(pushed) => pushed(self, top, mode, arg),
                None => 0,
            }
        }
    }

    /// Pop the topmost live layer.
    pub fn pop(&mut self) {
        if let Some(i) = self.top_index() {
            self.pop_at(i);
        }
    }

    /// Pop the layer at slot `i`. Never fails; at worst it defers the
    /// actual release.
    pub fn pop_at(&mut self, i: usize) {
        if self.slots[i].def.is_none() {
            return;
        }
        log::debug!(
            "pop {} at {}",
            self.slots[i].def.map(|d| d.name).unwrap_or("(cleared)"),
            i
        );
        if let Some(popped) = self.slots[i].def.and_then(|d| d.popped) {
            // Nonzero: the layer freed itself or is shared and still in
            // use elsewhere; leave the slot alone.
            if popped(self, i) != 0 {
                return;
            }
        } else if base_popped(self, i) != 0 {
            return;
        }
        if self.slots[i].lock > 0 || self.busy > 0 {
            // In use: defer freeing. The slot stays linked so indices held
            // by in-flight frames remain meaningful.
            let slot = &mut self.slots[i];
            slot.def = None;
            slot.flags = F_CLEARED;
        } else {
            self.slots.remove(i);
        }
    }

    /// Close the whole handle: close the top layer (which cascades down),
    /// then pop everything. Lock-deferred slots survive as CLEARED until
    /// the final sweep.
    pub fn close(&mut self) -> i32 {
        let code = match self.top_index() {
            Some(top) => self.close_at(top),
            None => {
                set_errno(libc::EBADF);
                -1
            }
        };
        while let Some(top) = self.top_index() {
            self.pop_at(top);
        }
        self.sweep();
        code
    }

    // -----------------------------------------------------------------
    // EINTR / async-check protocol
    // -----------------------------------------------------------------

    /// Run the async-check hook after an `EINTR`, holding a lock count on
    /// slot `i` so a re-entrant pop cannot free it. Returns true when the
    /// hook invalidated this handle: the caller must abort instead of
    /// retrying (CLEARED slots are reclaimed at the next quiescent sweep).
    pub(crate) fn async_run(&mut self, i: usize) -> bool {
        self.slots[i].lock += 1;
        let token = self.token();
        hooks::run_async_check(&token);
        self.slots[i].lock -= 1;
        if self.shared.take_close_request() {
            // The callback asked for teardown; apply it here, on the
            // owning frame, rather than from inside the callback.
            self.close();
        }
        self.slots[i].flags & F_CLEARED != 0
    }

    // -----------------------------------------------------------------
    // Operation dispatch
    // -----------------------------------------------------------------

    fn live_def(&self, i: usize) -> Option<&'static LayerDef> {
        self.slots.get(i).and_then(|s| s.def)
    }

    pub fn read_at(&mut self, i: usize, buf: &mut [u8]) -> isize {
        match self.live_def(i) {
            Some(def) => {
                self.enter();
                let r = def.read.unwrap_or(base_read)(self, i, buf);
                self.leave();
                r
            }
            None => {
                set_errno(libc::EBADF);
                -1
            }
        }
    }

    pub fn unread_at(&mut self, i: usize, data: &[u8]) -> isize {
        match self.live_def(i) {
            Some(def) => {
                self.enter();
                let r = def.unread.unwrap_or(base_unread)(self, i, data);
                self.leave();
                r
            }
            None => {
                set_errno(libc::EBADF);
                -1
            }
        }
    }

    pub fn write_at(&mut self, i: usize, data: &[u8]) -> isize {
        match self.live_def(i).and_then(|d| d.write) {
            Some(write) => {
                self.enter();
                let r = write(self, i, data);
                self.leave();
                r
            }
            None => {
                set_errno(libc::EBADF);
                -1
            }
        }
    }

    pub fn seek_at(&mut self, i: usize, offset: i64, whence: i32) -> i32 {
        match self.live_def(i).and_then(|d| d.seek) {
            Some(seek) => {
                self.enter();
                let r = seek(self, i, offset, whence);
                self.leave();
                r
            }
            None => {
                set_errno(libc::EINVAL);
                -1
            }
        }
    }

    pub fn tell_at(&mut self, i: usize) -> i64 {
        match self.live_def(i).and_then(|d| d.tell) {
            Some(tell) => {
                self.enter();
                let r = tell(self, i);
                self.leave();
                r
            }
            None => -1,
        }
    }

    pub fn close_at(&mut self, i: usize) -> i32 {
        match self.live_def(i) {
            Some(def) => {
                self.enter();
                let r = def.close.unwrap_or(base_close)(self, i);
                self.leave();
                r
            }
            None => {
                set_errno(libc::EBADF);
                -1
            }
        }
    }

    /// Flush at slot `i`. A def without a flush op silently succeeds.
    pub fn flush_at(&mut self, i: usize) -> i32 {
        match self.live_def(i) {
            Some(def) => match def.flush {
                Some(flush) => {
                    self.enter();
                    let r = flush(self, i);
                    self.leave();
                    r
                }
                None => 0,
            },
            None => {
                set_errno(libc::EBADF);
                -1
            }
        }
    }

    /// Flush the topmost layer (cascades down by construction).
    pub fn flush(&mut self) -> i32 {
        match self.top_index() {
            Some(top) => self.flush_at(top),
            None => {
                set_errno(libc::EBADF);
                -1
            }
        }
    }

    pub fn fill_at(&mut self, i: usize) -> i32 {
        match self.live_def(i).and_then(|d| d.fill) {
            Some(fill) => {
                self.enter();
                let r = fill(self, i);
                self.leave();
                r
            }
            None => -1,
        }
    }

    pub fn eof_at(&self, i: usize) -> bool {
        match self.live_def(i) {
            Some(def) => def.eof.unwrap_or(base_eof)(self, i),
            None => true,
        }
    }

    pub fn error_at(&self, i: usize) -> bool {
        match self.live_def(i) {
            Some(def) => def.error.unwrap_or(base_error)(self, i),
            None => true,
        }
    }

    pub fn clearerr_at(&mut self, i: usize) {
        if let Some(def) = self.live_def(i) {
            def.clearerr.unwrap_or(base_clearerr)(self, i);
        }
    }

    pub fn fileno_at(&self, i: usize) -> RawFd {
        match self.live_def(i) {
            Some(def) => def.fileno.unwrap_or(base_fileno)(self, i),
            None => -1,
        }
    }

    pub fn binmode_at(&mut self, i: usize) -> i32 {
        match self.live_def(i) {
            Some(def) => {
                self.enter();
                let r = def.binmode.unwrap_or(base_binmode)(self, i);
                self.leave();
                r
            }
            None => -1,
        }
    }

    // Buffer introspection protocol (the fast-gets interface).

    pub fn get_base_at(&mut self, i: usize) {
        if let Some(get_base) = self.live_def(i).and_then(|d| d.get_base) {
            get_base(self, i);
        }
    }

    pub fn bufsiz_at(&self, i: usize) -> usize {
        match self.live_def(i).and_then(|d| d.bufsiz) {
            Some(bufsiz) => bufsiz(self, i),
            None => 0,
        }
    }

    pub fn get_ptr_at(&self, i: usize) -> usize {
        match self.live_def(i).and_then(|d| d.get_ptr) {
            Some(get_ptr) => get_ptr(self, i),
            None => 0,
        }
    }

    pub fn get_cnt_at(&self, i: usize) -> isize {
        match self.live_def(i).and_then(|d| d.get_cnt) {
            Some(get_cnt) => get_cnt(self, i),
            None => 0,
        }
    }

    pub fn peek_at(&self, i: usize) -> Option<&[u8]> {
        self.live_def(i).and_then(|d| d.peek).map(|peek| peek(self, i))
    }

    pub fn set_ptrcnt_at(&mut self, i: usize, ptr: usize, cnt: isize) {
        if let Some(set_ptrcnt) = self.live_def(i).and_then(|d| d.set_ptrcnt) {
            self.enter();
            set_ptrcnt(self, i, ptr, cnt);
            self.leave();
        }
    }

    /// Whether slot `i` exposes the full fast-gets buffer protocol, i.e.
    /// an upper buffered layer may pull bytes straight out of its buffer.
    pub fn fast_gets(&self, i: usize) -> bool {
        self.live_def(i)
            .map(|d| d.set_ptrcnt.is_some() && d.get_cnt.is_some() && d.peek.is_some())
            .unwrap_or(false)
            && self.slots[i].flags & super::F_FASTGETS != 0
    }

    // -----------------------------------------------------------------
    // State accessors for layer implementations
    // -----------------------------------------------------------------

    /// Buffer state of slot `i`, for layers built on [`BufState`]
    /// (buffer, crlf, pending).
    pub(crate) fn buf_state(&self, i: usize) -> Option<&BufState> {
        match &self.slots[i].state {
            LayerState::Buf(b) => Some(b),
            LayerState::Crlf(c) => Some(&c.b),
            _ => None,
        }
    }

    pub(crate) fn buf_state_mut(&mut self, i: usize) -> Option<&mut BufState> {
        match &mut self.slots[i].state {
            LayerState::Buf(b) => Some(b),
            LayerState::Crlf(c) => Some(&mut c.b),
            _ => None,
        }
    }

    /// Temporarily take slot `i`'s buffer state out so an operation can
    /// hold it across recursive calls into lower layers (which never touch
    /// slot `i`). Must be paired with [`LayerStack::put_buf`].
    pub(crate) fn take_buf(&mut self, i: usize) -> BufState {
        self.buf_state_mut(i)
            .map(std::mem::take)
            .expect("slot does not carry a buffer state")
    }

    pub(crate) fn put_buf(&mut self, i: usize, b: BufState) {
        match &mut self.slots[i].state {
            LayerState::Buf(slot) => *slot = b,
            LayerState::Crlf(c) => c.b = b,
            _ => {
                // The slot was cleared and recycled while the op held the
                // state; nothing to restore into.
            }
        }
    }
}
