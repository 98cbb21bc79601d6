//! Generic block-buffered layer ("perlio").
//!
//! Sits above a raw layer and services reads and writes from a single
//! heap buffer driven by a fill/flush cycle. The state machine is
//! {idle, read-filled, write-dirty}: mixed read/write handles always
//! flush before a fill or a write takes the buffer over, and `posn`
//! tracks the downstream offset of `buf[0]` so `tell` never has to ask
//! the OS while data sits in the buffer.

use crate::error::set_errno;

use super::stack::LayerStack;
use super::{
    base_close, base_dup, base_open, base_pushed, LayerDef, LayerState, F_APPEND, F_CANWRITE,
    F_EOF, F_ERROR, F_LINEBUF, F_RDBUF, F_UNBUF, F_WRBUF, KIND_BUFFERED, KIND_RAW,
};

/// Default buffer capacity when the spec string does not override it.
pub const DEFAULT_BUFSIZ: usize = 8192;

/// Buffer state shared by the buffer, crlf and pending layers.
///
/// `ptr` and `end` are offsets into `buf`. Reading: valid data is
/// `buf[ptr..end]`. Writing: pending output is `buf[..ptr]` and `end` is
/// unused. Invariant: `ptr <= end <= bufsiz` whenever F_RDBUF is set.
pub struct BufState {
    /// Lazily allocated; empty until the first fill/write needs it.
    pub buf: Vec<u8>,
    pub ptr: usize,
    pub end: usize,
    pub bufsiz: usize,
    /// Downstream offset of `buf[0]` as of the last fill or flush.
    /// -1 when unknown (downstream refused to seek).
    pub posn: i64,
}

impl Default for BufState {
    fn default() -> Self {
        BufState {
            buf: Vec::new(),
            ptr: 0,
            end: 0,
            bufsiz: DEFAULT_BUFSIZ,
            posn: 0,
        }
    }
}

impl BufState {
    /// Allocate the backing buffer if it does not exist yet.
    pub(crate) fn ensure(&mut self) {
        if self.buf.is_empty() {
            if self.bufsiz == 0 {
                self.bufsiz = DEFAULT_BUFSIZ;
            }
            self.buf = vec![0; self.bufsiz];
        }
    }
}

pub(crate) fn buf_pushed(
    stack: &mut LayerStack,
    i: usize,
    mode: Option<&str>,
    arg: Option<&str>,
) -> i32 {
    let code = base_pushed(stack, i, mode, arg);
    if code != 0 {
        return code;
    }
    // A numeric argument overrides the buffer capacity.
    if let Some(size) = arg.and_then(|a| a.trim().parse::<usize>().ok()) {
        if size > 0 {
            if let Some(b) = stack.buf_state_mut(i) {
                b.bufsiz = size;
            }
        }
    }
    let fd = stack.fileno_at(i);
    if fd >= 0 && unsafe { libc::isatty(fd) } != 0 {
        stack.slot_mut(i).flags |= F_LINEBUF;
    }
    // Start logical position where the layer below currently is.
    if let Some(below) = stack.next_below(i) {
        let posn = stack.tell_at(below);
        if let Some(b) = stack.buf_state_mut(i) {
            b.posn = if posn == -1 { 0 } else { posn };
        }
    }
    code
}

pub(crate) fn buf_popped(stack: &mut LayerStack, i: usize) -> i32 {
    if let Some(b) = stack.buf_state_mut(i) {
        b.buf = Vec::new();
        b.ptr = 0;
        b.end = 0;
    }
    0
}

/// Replenish the read buffer from the layer below. Flushes any dirty
/// write data first; pulls straight out of a fast-gets layer's buffer
/// where possible instead of issuing a fresh read.
pub(crate) fn buf_fill(stack: &mut LayerStack, i: usize) -> i32 {
    if buf_flush(stack, i) != 0 {
        return -1;
    }
    let below = match stack.next_below(i) {
        Some(n) => n,
        None => {
            set_errno(libc::EBADF);
            return -1;
        }
    };
    if let Some(b) = stack.buf_state_mut(i) {
        b.ensure();
        b.ptr = 0;
        b.end = 0;
    }
    let mut b = stack.take_buf(i);
    let avail: isize;
    if stack.fast_gets(below) {
        // The layer below keeps its own buffer (e.g. pending data):
        // drain that directly, no syscall and no extra copy through it.
        let mut cnt = stack.get_cnt_at(below);
        if cnt <= 0 {
            if stack.fill_at(below) == 0 {
                cnt = stack.get_cnt_at(below);
            } else {
                cnt = if stack.error_at(below) { -1 } else { 0 };
            }
        }
        if cnt > 0 {
            let take = (cnt as usize).min(b.bufsiz);
            let ptr = stack.get_ptr_at(below);
            if let Some(src) = stack.peek_at(below) {
                b.buf[..take].copy_from_slice(&src[..take]);
            }
            stack.set_ptrcnt_at(below, ptr + take, cnt - take as isize);
            avail = take as isize;
        } else {
            avail = cnt;
        }
    } else {
        avail = stack.read_at(below, &mut b.buf[..b.bufsiz]);
    }
    let end = if avail > 0 { avail as usize } else { 0 };
    b.end = end;
    stack.put_buf(i, b);
    if stack.slot(i).def.is_none() {
        // The async-check hook tore the handle down mid-read.
        return -1;
    }
    if avail <= 0 {
        if avail == 0 {
            stack.slot_mut(i).flags |= F_EOF;
        } else {
            stack.slot_mut(i).flags |= F_ERROR;
            stack.save_errno(i);
        }
        return -1;
    }
    stack.slot_mut(i).flags |= F_RDBUF;
    log::trace!("fill slot {}: {} bytes", i, avail);
    0
}

/// Drain a dirty write buffer downstream, or give unconsumed read data
/// back by seeking the layer below to the logical position. When the
/// downstream cannot seek the read buffer is kept as it is, so nothing
/// already pulled off a pipe or tty is thrown away. Otherwise ends idle
/// and flushes the layer below.
pub(crate) fn buf_flush(stack: &mut LayerStack, i: usize) -> i32 {
    let mut code = 0;
    let below = stack.next_below(i);
    let flags = stack.slot(i).flags;
    if flags & F_WRBUF != 0 {
        let below = match below {
            Some(n) => n,
            None => {
                set_errno(libc::EBADF);
                return -1;
            }
        };
        let mut b = stack.take_buf(i);
        // Loop over partial writes; stop on the first hard error.
        let mut at = 0;
        while at < b.ptr {
            let count = stack.write_at(below, &b.buf[at..b.ptr]);
            if count > 0 {
                at += count as usize;
            } else if count < 0 || stack.error_at(below) {
                code = -1;
                break;
            }
        }
        b.posn += at as i64;
        stack.put_buf(i, b);
        if code != 0 && stack.slot(i).def.is_some() {
            stack.slot_mut(i).flags |= F_ERROR;
            stack.save_errno(i);
        }
    } else if flags & F_RDBUF != 0 {
        let mut b = stack.take_buf(i);
        b.posn += b.ptr as i64;
        if b.ptr < b.end {
            // Not all consumed: try to hand the remainder back to the
            // layer below by seeking it to our logical position.
            match below {
                Some(n) if stack.seek_at(n, b.posn, libc::SEEK_SET) == 0 => {
                    b.posn = stack.tell_at(n);
                }
                _ => {
                    // Non-seekable stream: undo the position adjustment
                    // and keep the buffer intact, so pre-read data is
                    // not lost for good.
                    b.posn -= b.ptr as i64;
                    stack.put_buf(i, b);
                    if stack.slot(i).def.is_none() {
                        return -1;
                    }
                    return code;
                }
            }
        }
        stack.put_buf(i, b);
    }
    if stack.slot(i).def.is_none() {
        return -1;
    }
    if let Some(b) = stack.buf_state_mut(i) {
        b.ptr = 0;
        b.end = 0;
    }
    stack.slot_mut(i).flags &= !(F_RDBUF | F_WRBUF);
    if let Some(n) = below {
        if stack.flush_at(n) != 0 {
            code = -1;
        }
    }
    code
}

/// Buffered write. Copies into the buffer, flushing whenever the buffer
/// fills; honors line-buffered handles by flushing through the last
/// newline of the request, and unbuffered handles by flushing at the end.
pub(crate) fn buf_write(stack: &mut LayerStack, i: usize, data: &[u8]) -> isize {
    if stack.slot(i).flags & F_CANWRITE == 0 {
        set_errno(libc::EBADF);
        return 0;
    }
    if stack.slot(i).flags & F_RDBUF != 0 && buf_flush(stack, i) != 0 {
        return 0;
    }
    if let Some(b) = stack.buf_state_mut(i) {
        b.ensure();
    }
    let flushpoint = if stack.slot(i).flags & F_LINEBUF != 0 {
        match data.iter().rposition(|&c| c == b'\n') {
            Some(p) => p + 1,
            None => 0,
        }
    } else {
        0
    };
    let mut written = 0;
    while written < data.len() {
        stack.slot_mut(i).flags |= F_WRBUF;
        let b = match stack.buf_state_mut(i) {
            Some(b) => b,
            None => break,
        };
        let mut avail = b.bufsiz - b.ptr;
        if avail > data.len() - written {
            avail = data.len() - written;
        }
        if flushpoint > written && flushpoint <= written + avail {
            avail = flushpoint - written;
        }
        let ptr = b.ptr;
        b.buf[ptr..ptr + avail].copy_from_slice(&data[written..written + avail]);
        b.ptr += avail;
        written += avail;
        let full = b.ptr >= b.bufsiz;
        if (flushpoint != 0 && written == flushpoint) || full {
            if buf_flush(stack, i) != 0 {
                return -1;
            }
        }
        if stack.slot(i).def.is_none() {
            return -1;
        }
    }
    if stack.slot(i).flags & F_UNBUF != 0 {
        buf_flush(stack, i);
    }
    written as isize
}

/// Push bytes back so the next reads return them again. An idle buffer is
/// repurposed as a full-capacity reverse buffer; bytes that do not fit are
/// handed to the layer below's unread (which stages them in a pending
/// layer).
pub(crate) fn buf_unread(stack: &mut LayerStack, i: usize, data: &[u8]) -> isize {
    if stack.slot(i).flags & F_WRBUF != 0 {
        buf_flush(stack, i);
    }
    if let Some(b) = stack.buf_state_mut(i) {
        b.ensure();
    }
    let mut unread = 0;
    {
        if stack.slot(i).flags & F_RDBUF == 0 {
            // Idle: walk bytes backward into the whole buffer.
            stack.slot_mut(i).flags |= F_RDBUF;
            if let Some(b) = stack.buf_state_mut(i) {
                b.ptr = b.bufsiz;
                b.end = b.bufsiz;
                b.posn -= b.bufsiz as i64;
            }
        }
        if let Some(b) = stack.buf_state_mut(i) {
            let mut avail = b.ptr;
            if avail > data.len() {
                avail = data.len();
            }
            if avail > 0 {
                let from = data.len() - avail;
                b.ptr -= avail;
                let ptr = b.ptr;
                b.buf[ptr..ptr + avail].copy_from_slice(&data[from..]);
                unread = avail;
            }
        }
        if unread > 0 {
            stack.slot_mut(i).flags &= !F_EOF;
        }
    }
    let rest = data.len() - unread;
    if rest > 0 {
        // Overflow: the leading bytes go into a pending layer pushed
        // above this one, so they still read back first.
        let more = super::base_unread(stack, i, &data[..rest]);
        if more > 0 {
            unread += more as usize;
        }
    }
    unread as isize
}

/// Flush, delegate the seek downstream, then re-learn `posn` from the
/// layer below.
pub(crate) fn buf_seek(stack: &mut LayerStack, i: usize, offset: i64, whence: i32) -> i32 {
    let mut code = buf_flush(stack, i);
    if code == 0 {
        stack.slot_mut(i).flags &= !F_EOF;
        let below = match stack.next_below(i) {
            Some(n) => n,
            None => {
                set_errno(libc::EBADF);
                return -1;
            }
        };
        code = stack.seek_at(below, offset, whence);
        if code == 0 {
            let posn = stack.tell_at(below);
            if let Some(b) = stack.buf_state_mut(i) {
                b.posn = posn;
            }
        }
    }
    code
}

/// `posn` plus the cursor offset into the buffer. Append-mode handles
/// flush and re-query the layer below first, since O_APPEND moves the
/// real position at every write.
pub(crate) fn buf_tell(stack: &mut LayerStack, i: usize) -> i64 {
    let flags = stack.slot(i).flags;
    if flags & F_APPEND != 0 && flags & F_WRBUF != 0 {
        if buf_flush(stack, i) != 0 {
            return -1;
        }
        let posn = match stack.next_below(i) {
            Some(n) => stack.tell_at(n),
            None => -1,
        };
        if let Some(b) = stack.buf_state_mut(i) {
            b.posn = posn;
        }
    }
    match stack.buf_state(i) {
        Some(b) => {
            if b.posn == -1 {
                -1
            } else {
                b.posn + b.ptr as i64
            }
        }
        None => -1,
    }
}

pub(crate) fn buf_close(stack: &mut LayerStack, i: usize) -> i32 {
    let code = base_close(stack, i);
    if let Some(b) = stack.buf_state_mut(i) {
        b.buf = Vec::new();
        b.ptr = 0;
        b.end = 0;
    }
    code
}

// Fast-gets buffer protocol, used by an upper buffered layer to drain
// this one without an extra syscall.

pub(crate) fn buf_get_base(stack: &mut LayerStack, i: usize) {
    if let Some(b) = stack.buf_state_mut(i) {
        b.ensure();
    }
}

pub(crate) fn buf_bufsiz(stack: &LayerStack, i: usize) -> usize {
    stack.buf_state(i).map(|b| b.bufsiz).unwrap_or(0)
}

pub(crate) fn buf_get_ptr(stack: &LayerStack, i: usize) -> usize {
    stack.buf_state(i).map(|b| b.ptr).unwrap_or(0)
}

pub(crate) fn buf_get_cnt(stack: &LayerStack, i: usize) -> isize {
    match stack.buf_state(i) {
        Some(b) if stack.slot(i).flags & F_RDBUF != 0 => (b.end - b.ptr) as isize,
        _ => 0,
    }
}

pub(crate) fn buf_peek(stack: &LayerStack, i: usize) -> &[u8] {
    match stack.buf_state(i) {
        Some(b) if stack.slot(i).flags & F_RDBUF != 0 => &b.buf[b.ptr..b.end],
        _ => &[],
    }
}

pub(crate) fn buf_set_ptrcnt(stack: &mut LayerStack, i: usize, ptr: usize, cnt: isize) {
    if let Some(b) = stack.buf_state_mut(i) {
        debug_assert!(ptr <= b.end && ptr + cnt.max(0) as usize <= b.end);
        b.ptr = ptr;
        let _ = cnt;
    }
}

pub static BUF_DEF: LayerDef = LayerDef {
    name: "perlio",
    size: std::mem::size_of::<BufState>(),
    kind: KIND_BUFFERED | KIND_RAW,
    mk_state: Some(|| LayerState::Buf(BufState::default())),
    pushed: Some(buf_pushed),
    popped: Some(buf_popped),
    open: Some(base_open),
    dup: Some(base_dup),
    // read is the generic ptr/cnt consumer (base_read).
    unread: Some(buf_unread),
    write: Some(buf_write),
    seek: Some(buf_seek),
    tell: Some(buf_tell),
    close: Some(buf_close),
    flush: Some(buf_flush),
    fill: Some(buf_fill),
    get_base: Some(buf_get_base),
    bufsiz: Some(buf_bufsiz),
    get_ptr: Some(buf_get_ptr),
    get_cnt: Some(buf_get_cnt),
    peek: Some(buf_peek),
    set_ptrcnt: Some(buf_set_ptrcnt),
    ..LayerDef::EMPTY
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_defaults_are_idle() {
        let b = BufState::default();
        assert!(b.buf.is_empty());
        assert_eq!(b.ptr, 0);
        assert_eq!(b.end, 0);
        assert_eq!(b.bufsiz, DEFAULT_BUFSIZ);
        assert_eq!(b.posn, 0);
    }

    #[test]
    fn ensure_allocates_once() {
        let mut b = BufState::default();
        b.ensure();
        assert_eq!(b.buf.len(), DEFAULT_BUFSIZ);
        let addr = b.buf.as_ptr();
        b.ensure();
        assert_eq!(b.buf.as_ptr(), addr);
    }
}
