//! CRLF translation layer.
//!
//! A buffered layer whose buffer always holds the raw on-disk bytes.
//! Translation happens at the copy boundaries, never by rewriting the
//! buffer in place: on read, each CR,LF pair collapses to LF as bytes are
//! copied out; on write, each LF expands to CR,LF as bytes are committed
//! to the buffer. Raw re-reads,
//! `unread` and `tell` therefore always see true stream contents and
//! offsets.
//!
//! A CR that is the final byte of the buffer is ambiguous (the LF may be
//! in the next block); the layer tops the buffer up once, keeping the
//! unconsumed tail, before deciding. Translation is wholly disabled while
//! the handle's CRLF flag is off, which is how binary mode works.

use crate::error::set_errno;

use super::buffer::{
    buf_bufsiz, buf_close, buf_fill, buf_flush, buf_get_base, buf_popped, buf_pushed, buf_seek,
    buf_tell, buf_unread, buf_write, BufState,
};
use super::stack::LayerStack;
use super::{
    base_open, base_dup, LayerDef, LayerState, F_CANWRITE, F_CRLF, F_EOF, F_LINEBUF, F_RDBUF,
    F_UNBUF, F_UTF8, F_WRBUF, KIND_BUFFERED, KIND_CANCRLF, KIND_RAW,
};

const CR: u8 = 0x0d;
const LF: u8 = 0x0a;

/// Buffer state plus nothing extra: the CR position needs no out-of-band
/// slot because pairs are resolved at copy-out time against raw bytes.
pub struct CrlfState {
    pub b: BufState,
}

fn crlf_pushed(stack: &mut LayerStack, i: usize, mode: Option<&str>, arg: Option<&str>) -> i32 {
    // Text translation on by default; a trailing 'b' in the mode turns it
    // back off inside buf_pushed.
    stack.slot_mut(i).flags |= F_CRLF;
    let code = buf_pushed(stack, i, mode, arg);
    if code != 0 {
        return code;
    }
    if let Some(below) = stack.next_below(i) {
        // Stacking crlf on crlf: reactivate the existing layer and drop
        // the redundant new one.
        let below_is_crlf = stack
            .slot(below)
            .def
            .map(|d| d.kind & KIND_CANCRLF != 0)
            .unwrap_or(false);
        if below_is_crlf {
            stack.slot_mut(below).flags |= F_CRLF;
            stack.pop_at(i);
            return 0;
        }
        if stack.slot(below).flags & F_UTF8 != 0 {
            stack.slot_mut(i).flags |= F_UTF8;
        }
    }
    code
}

/// Top the buffer up without discarding the unconsumed tail: used exactly
/// once to disambiguate a CR sitting at the end of the buffer. Returns the
/// number of new bytes, 0 at EOF, -1 on error.
fn crlf_fill_more(stack: &mut LayerStack, i: usize) -> isize {
    let below = match stack.next_below(i) {
        Some(n) => n,
        None => return -1,
    };
    let mut b = stack.take_buf(i);
    // Slide the tail to the front so the read appends after it.
    if b.ptr > 0 {
        b.buf.copy_within(b.ptr..b.end, 0);
        b.posn += b.ptr as i64;
        b.end -= b.ptr;
        b.ptr = 0;
    }
    let start = b.end;
    let avail = if start < b.bufsiz {
        stack.read_at(below, &mut b.buf[start..b.bufsiz])
    } else {
        0
    };
    if avail > 0 {
        b.end += avail as usize;
    }
    stack.put_buf(i, b);
    if stack.slot(i).def.is_none() {
        return -1;
    }
    if avail == 0 {
        stack.slot_mut(i).flags |= F_EOF;
    } else if avail < 0 {
        stack.save_errno(i);
    }
    avail
}

/// Read with CR,LF collapsed to LF on the way out. Lone CRs pass through
/// untouched. A trailing ambiguous CR defers: if anything has already been
/// produced it is returned first, so an interactive stream is never
/// blocked on for bytes the caller did not need yet.
/// Untranslated buffered read, used while the CRLF flag is off. The layer
/// is not fast-gets so this copies straight out of its own buffer instead
/// of going through the generic ptr/cnt protocol.
fn crlf_raw_read(stack: &mut LayerStack, i: usize, out: &mut [u8]) -> isize {
    let mut done = 0;
    while done < out.len() {
        let avail = match stack.buf_state(i) {
            Some(b) if stack.slot(i).flags & F_RDBUF != 0 => b.end - b.ptr,
            _ => 0,
        };
        if avail == 0 {
            if buf_fill(stack, i) != 0 {
                break;
            }
            continue;
        }
        let take = avail.min(out.len() - done);
        if let Some(b) = stack.buf_state(i) {
            out[done..done + take].copy_from_slice(&b.buf[b.ptr..b.ptr + take]);
        }
        if let Some(b) = stack.buf_state_mut(i) {
            b.ptr += take;
        }
        done += take;
    }
    done as isize
}

fn crlf_read(stack: &mut LayerStack, i: usize, out: &mut [u8]) -> isize {
    if stack.slot(i).flags & F_CRLF == 0 {
        return crlf_raw_read(stack, i, out);
    }
    let mut done = 0;
    'refill: while done < out.len() {
        if stack
            .buf_state(i)
            .map(|b| b.ptr >= b.end)
            .unwrap_or(true)
            || stack.slot(i).flags & F_RDBUF == 0
        {
            if buf_fill(stack, i) != 0 {
                break;
            }
        }
        loop {
            let (byte, next, last) = match stack.buf_state(i) {
                Some(b) if b.ptr < b.end => (
                    b.buf[b.ptr],
                    if b.ptr + 1 < b.end {
                        Some(b.buf[b.ptr + 1])
                    } else {
                        None
                    },
                    b.ptr + 1 == b.end,
                ),
                _ => continue 'refill,
            };
            if done == out.len() {
                break 'refill;
            }
            if byte == CR {
                match next {
                    Some(LF) => {
                        out[done] = LF;
                        done += 1;
                        if let Some(b) = stack.buf_state_mut(i) {
                            b.ptr += 2;
                        }
                    }
                    Some(_) => {
                        out[done] = CR;
                        done += 1;
                        if let Some(b) = stack.buf_state_mut(i) {
                            b.ptr += 1;
                        }
                    }
                    None => {
                        debug_assert!(last);
                        if done > 0 {
                            // Caller already has data; leave the CR for
                            // the next read rather than blocking now.
                            break 'refill;
                        }
                        let more = crlf_fill_more(stack, i);
                        if more > 0 {
                            continue;
                        }
                        // EOF or error below: the CR is genuinely lone.
                        out[done] = CR;
                        done += 1;
                        if let Some(b) = stack.buf_state_mut(i) {
                            b.ptr += 1;
                        }
                        break 'refill;
                    }
                }
            } else {
                // Copy the whole CR-free run in one go.
                let (run, from) = match stack.buf_state(i) {
                    Some(b) => {
                        let span = &b.buf[b.ptr..b.end];
                        let run = span
                            .iter()
                            .position(|&c| c == CR)
                            .unwrap_or(span.len())
                            .min(out.len() - done);
                        (run, b.ptr)
                    }
                    None => break 'refill,
                };
                if let Some(b) = stack.buf_state(i) {
                    out[done..done + run].copy_from_slice(&b.buf[from..from + run]);
                }
                if let Some(b) = stack.buf_state_mut(i) {
                    b.ptr += run;
                }
                done += run;
                if done == out.len() {
                    break 'refill;
                }
            }
        }
    }
    done as isize
}

/// Unread logical bytes: with translation on, each LF goes back into the
/// buffer as its on-disk CR,LF pair so the raw-bytes invariant holds.
fn crlf_unread(stack: &mut LayerStack, i: usize, data: &[u8]) -> isize {
    if stack.slot(i).flags & F_CRLF == 0 {
        return buf_unread(stack, i, data);
    }
    if stack.slot(i).flags & F_WRBUF != 0 {
        buf_flush(stack, i);
    }
    if let Some(b) = stack.buf_state_mut(i) {
        b.ensure();
    }
    if stack.slot(i).flags & F_RDBUF == 0 {
        stack.slot_mut(i).flags |= F_RDBUF;
        if let Some(b) = stack.buf_state_mut(i) {
            b.ptr = b.bufsiz;
            b.end = b.bufsiz;
            b.posn -= b.bufsiz as i64;
        }
    }
    let mut taken = 0;
    if let Some(b) = stack.buf_state_mut(i) {
        for (k, &c) in data.iter().enumerate().rev() {
            let need = if c == LF { 2 } else { 1 };
            if b.ptr < need {
                break;
            }
            if c == LF {
                b.buf[b.ptr - 1] = LF;
                b.buf[b.ptr - 2] = CR;
            } else {
                b.buf[b.ptr - 1] = c;
            }
            b.ptr -= need;
            taken = data.len() - k;
        }
    }
    if taken > 0 {
        stack.slot_mut(i).flags &= !F_EOF;
    }
    let rest = data.len() - taken;
    if rest > 0 {
        // Leading overflow is staged above us so it reads back first.
        let more = super::base_unread(stack, i, &data[..rest]);
        if more > 0 {
            return (taken as isize) + more;
        }
    }
    taken as isize
}

/// Write with each LF committed as CR,LF. A pair never straddles the
/// buffer boundary: the buffer flushes first when only one byte remains.
fn crlf_write(stack: &mut LayerStack, i: usize, data: &[u8]) -> isize {
    if stack.slot(i).flags & F_CRLF == 0 {
        return buf_write(stack, i, data);
    }
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
    // Snapshot: the buffer state borrow spans the whole commit loop.
    let linebuf = stack.slot(i).flags & F_LINEBUF != 0;
    let mut written = 0;
    while written < data.len() {
        stack.slot_mut(i).flags |= F_WRBUF;
        let mut line_flush = false;
        let mut full = false;
        if let Some(b) = stack.buf_state_mut(i) {
            while written < data.len() && b.ptr < b.bufsiz {
                let c = data[written];
                if c == LF {
                    if b.ptr + 2 > b.bufsiz {
                        full = true;
                        break;
                    }
                    b.buf[b.ptr] = CR;
                    b.buf[b.ptr + 1] = LF;
                    b.ptr += 2;
                    written += 1;
                    if linebuf {
                        line_flush = true;
                        break;
                    }
                } else {
                    b.buf[b.ptr] = c;
                    b.ptr += 1;
                    written += 1;
                }
            }
            full = full || b.ptr >= b.bufsiz;
        }
        if (line_flush || full) && buf_flush(stack, i) != 0 {
            return -1;
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

/// Binary mode: stop translating, drain anything pending, and since the
/// native line ending already is LF the layer has no further job: pop it.
fn crlf_binmode(stack: &mut LayerStack, i: usize) -> i32 {
    if stack.slot(i).flags & F_CRLF != 0 {
        stack.slot_mut(i).flags &= !F_CRLF;
        buf_flush(stack, i);
        stack.pop_at(i);
    }
    0
}

pub static CRLF_DEF: LayerDef = LayerDef {
    name: "crlf",
    size: std::mem::size_of::<CrlfState>(),
    kind: KIND_BUFFERED | KIND_CANCRLF | KIND_RAW,
    mk_state: Some(|| {
        LayerState::Crlf(CrlfState {
            b: BufState::default(),
        })
    }),
    pushed: Some(crlf_pushed),
    popped: Some(buf_popped),
    open: Some(base_open),
    binmode: Some(crlf_binmode),
    dup: Some(base_dup),
    read: Some(crlf_read),
    unread: Some(crlf_unread),
    write: Some(crlf_write),
    seek: Some(buf_seek),
    tell: Some(buf_tell),
    close: Some(buf_close),
    flush: Some(buf_flush),
    fill: Some(buf_fill),
    get_base: Some(buf_get_base),
    bufsiz: Some(buf_bufsiz),
    // No get_ptr/get_cnt/peek/set_ptrcnt: the raw buffer contents are not
    // what a consumer of this layer should see, so it is never fast-gets.
    ..LayerDef::EMPTY
};
