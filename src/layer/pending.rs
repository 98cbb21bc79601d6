//! Transient push-back layer.
//!
//! When bytes are unread past what a layer can hold itself, a pending
//! layer is pushed directly above it to stage them. It is a read buffer
//! that can never refill: flush discards whatever is staged and pops the
//! layer, and a drained layer pops itself mid-read, so the handle returns
//! to its original shape with no caller involvement.

use super::buffer::{
    buf_bufsiz, buf_get_base, buf_get_cnt, buf_get_ptr, buf_peek, buf_popped, buf_set_ptrcnt,
    buf_tell, buf_unread, BufState,
};
use super::stack::LayerStack;
use super::{base_pushed, LayerDef, LayerState, F_UTF8, KIND_BUFFERED, KIND_RAW};

fn pending_pushed(stack: &mut LayerStack, i: usize, mode: Option<&str>, arg: Option<&str>) -> i32 {
    let code = base_pushed(stack, i, mode, arg);
    // Push-back volumes are small; no need for a full-size block.
    if let Some(b) = stack.buf_state_mut(i) {
        b.bufsiz = 256;
    }
    // Carry the UTF-8 tag of what we sit on, so the stream's text-ness
    // does not flicker when this layer auto-pops.
    if let Some(below) = stack.next_below(i) {
        if stack.slot(below).flags & F_UTF8 != 0 {
            stack.slot_mut(i).flags |= F_UTF8;
        }
    }
    code
}

/// Pending data cannot be replenished; an empty pending layer is an
/// exhausted one.
fn pending_fill(_stack: &mut LayerStack, _i: usize) -> i32 {
    -1
}

/// Discard whatever is staged and remove the layer.
fn pending_flush(stack: &mut LayerStack, i: usize) -> i32 {
    if let Some(b) = stack.buf_state_mut(i) {
        b.buf = Vec::new();
        b.ptr = 0;
        b.end = 0;
    }
    stack.pop_at(i);
    0
}

/// The fast-gets consumer tells us the staged bytes are gone by setting
/// the count to zero; that is the moment the layer removes itself.
fn pending_set_ptrcnt(stack: &mut LayerStack, i: usize, ptr: usize, cnt: isize) {
    if cnt <= 0 {
        pending_flush(stack, i);
    } else {
        buf_set_ptrcnt(stack, i, ptr, cnt);
    }
}

/// Serve staged bytes, then pop and let the layer below satisfy the rest
/// of the request.
fn pending_read(stack: &mut LayerStack, i: usize, out: &mut [u8]) -> isize {
    let mut got = 0;
    if let Some(b) = stack.buf_state_mut(i) {
        let avail = (b.end - b.ptr).min(out.len());
        if avail > 0 {
            out[..avail].copy_from_slice(&b.buf[b.ptr..b.ptr + avail]);
            b.ptr += avail;
            got = avail;
        }
    }
    let drained = stack
        .buf_state(i)
        .map(|b| b.ptr >= b.end)
        .unwrap_or(true);
    if drained {
        let below = stack.next_below(i);
        pending_flush(stack, i);
        if got < out.len() {
            if let Some(n) = below {
                let more = stack.read_at(n, &mut out[got..]);
                if more > 0 {
                    got += more as usize;
                } else if got == 0 {
                    return more;
                }
            }
        }
    }
    got as isize
}

/// Seeking away from staged data abandons it: drop out of the stack and
/// let the real layer seek.
fn pending_seek(stack: &mut LayerStack, i: usize, offset: i64, whence: i32) -> i32 {
    let below = stack.next_below(i);
    pending_flush(stack, i);
    match below {
        Some(n) => stack.seek_at(n, offset, whence),
        None => -1,
    }
}

fn pending_close(stack: &mut LayerStack, i: usize) -> i32 {
    let below = stack.next_below(i);
    pending_flush(stack, i);
    match below {
        Some(n) => stack.close_at(n),
        None => 0,
    }
}

pub static PENDING_DEF: LayerDef = LayerDef {
    name: "pending",
    size: std::mem::size_of::<BufState>(),
    kind: KIND_BUFFERED | KIND_RAW,
    mk_state: Some(|| LayerState::Buf(BufState::default())),
    pushed: Some(pending_pushed),
    popped: Some(buf_popped),
    read: Some(pending_read),
    unread: Some(buf_unread),
    seek: Some(pending_seek),
    tell: Some(buf_tell),
    close: Some(pending_close),
    flush: Some(pending_flush),
    fill: Some(pending_fill),
    get_base: Some(buf_get_base),
    bufsiz: Some(buf_bufsiz),
    get_ptr: Some(buf_get_ptr),
    get_cnt: Some(buf_get_cnt),
    peek: Some(buf_peek),
    set_ptrcnt: Some(pending_set_ptrcnt),
    ..LayerDef::EMPTY
};
