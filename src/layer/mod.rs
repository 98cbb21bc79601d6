//! Layer object model.
//!
//! Every layer kind is described by a static [`LayerDef`]: a table of
//! operation function pointers plus capability flags and the size of the
//! layer's private state. Dispatch is `(stack, slot index)` based: an
//! operation may recurse into the layers below its slot, and push/pop
//! during a dispatched operation is safe because removal of slots is
//! deferred while the stack is busy (see [`stack`]).
//!
//! The `base_*` functions here are the shared fallback implementations a
//! definition can point at (or that the dispatcher substitutes when a def
//! leaves an op unset).

pub mod buffer;
pub mod crlf;
pub mod pending;
pub mod pseudo;
pub mod stack;
pub mod unix;

use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::set_errno;

use self::buffer::BufState;
use self::crlf::CrlfState;
use self::stack::LayerStack;
use self::unix::UnixState;

// Layer kind capabilities (LayerDef::kind).
pub const KIND_RAW: u32 = 0x0001; // suitable for a binary stream as-is
pub const KIND_BUFFERED: u32 = 0x0002; // maintains a fill/flush buffer
pub const KIND_CANCRLF: u32 = 0x0004; // can do CRLF translation
pub const KIND_DUMMY: u32 = 0x0008; // pseudo layer: no state, push adjusts stack
pub const KIND_UTF8: u32 = 0x0010; // tags the stream as UTF-8
pub const KIND_MULTIARG: u32 = 0x0020; // open may take multiple args
pub const KIND_DESTRUCT: u32 = 0x0040; // close on runtime teardown

// Per-instance flags (LayerSlot::flags).
pub const F_EOF: u32 = 0x0000_0001;
pub const F_CANWRITE: u32 = 0x0000_0002;
pub const F_CANREAD: u32 = 0x0000_0004;
pub const F_ERROR: u32 = 0x0000_0008;
pub const F_TRUNCATE: u32 = 0x0000_0010;
pub const F_APPEND: u32 = 0x0000_0020;
pub const F_CRLF: u32 = 0x0000_0040;
pub const F_UTF8: u32 = 0x0000_0080;
pub const F_UNBUF: u32 = 0x0000_0100;
pub const F_WRBUF: u32 = 0x0000_0200;
pub const F_RDBUF: u32 = 0x0000_0400;
pub const F_LINEBUF: u32 = 0x0000_0800;
pub const F_OPEN: u32 = 0x0000_1000;
pub const F_FASTGETS: u32 = 0x0000_2000;
/// Popped while locked: instance awaits a safe deallocation point.
pub const F_CLEARED: u32 = 0x0000_4000;

/// Handle-duplication behavior: duplicate the OS descriptor instead of
/// sharing it (and its refcount entry) with the original.
pub const DUP_FD: u32 = 0x0001;

/// Private per-layer state, a closed set of variants. Pseudo layers carry
/// [`LayerState::None`].
pub enum LayerState {
    None,
    Unix(UnixState),
    Buf(BufState),
    Crlf(CrlfState),
}

impl LayerState {
    /// Size of the carried state, checked against `LayerDef::size` on push.
    pub fn size(&self) -> usize {
        match self {
            LayerState::None => 0,
            LayerState::Unix(_) => std::mem::size_of::<UnixState>(),
            LayerState::Buf(_) => std::mem::size_of::<BufState>(),
            LayerState::Crlf(_) => std::mem::size_of::<CrlfState>(),
        }
    }
}

/// What `open` is asked to attach to.
pub enum OpenTarget<'a> {
    /// A filesystem path to open.
    Path(&'a Path),
    /// An already-open descriptor to adopt.
    Fd(RawFd),
}

/// One resolved element of a layer specification: a definition plus the
/// parenthesized argument it was given, if any.
#[derive(Clone)]
pub struct ChainLink {
    pub def: &'static LayerDef,
    pub arg: Option<String>,
}

pub type PushedFn = fn(&mut LayerStack, usize, Option<&str>, Option<&str>) -> i32;
pub type PoppedFn = fn(&mut LayerStack, usize) -> i32;
/// Open the OS resource through `chain[..=n]`; `n` is the opener's own
/// position in the resolved chain. Layers above `n` are pushed by the
/// caller afterwards.
pub type OpenFn = fn(chain: &[ChainLink], n: usize, mode: &str, target: &OpenTarget<'_>) -> Option<LayerStack>;
/// Rebuild this layer on `new` from slot `i` of `old`.
pub type DupFn = fn(new: &mut LayerStack, old: &LayerStack, i: usize, flags: u32) -> i32;

/// Static descriptor of a layer kind: capability flags, state size, and the
/// operations it implements. Unset operations fall back to the `base_*`
/// behavior (or fail) per the dispatcher in [`stack`].
#[derive(Clone, Copy)]
pub struct LayerDef {
    pub name: &'static str,
    /// Size of the private state; 0 marks a pseudo layer.
    pub size: usize,
    pub kind: u32,
    /// Constructor for the private state; `None` for pseudo layers.
    pub mk_state: Option<fn() -> LayerState>,
    pub pushed: Option<PushedFn>,
    pub popped: Option<PoppedFn>,
    pub open: Option<OpenFn>,
    pub binmode: Option<fn(&mut LayerStack, usize) -> i32>,
    pub fileno: Option<fn(&LayerStack, usize) -> RawFd>,
    pub dup: Option<DupFn>,
    pub read: Option<fn(&mut LayerStack, usize, &mut [u8]) -> isize>,
    pub unread: Option<fn(&mut LayerStack, usize, &[u8]) -> isize>,
    pub write: Option<fn(&mut LayerStack, usize, &[u8]) -> isize>,
    pub seek: Option<fn(&mut LayerStack, usize, i64, i32) -> i32>,
    pub tell: Option<fn(&mut LayerStack, usize) -> i64>,
    pub close: Option<fn(&mut LayerStack, usize) -> i32>,
    pub flush: Option<fn(&mut LayerStack, usize) -> i32>,
    pub fill: Option<fn(&mut LayerStack, usize) -> i32>,
    pub eof: Option<fn(&LayerStack, usize) -> bool>,
    pub error: Option<fn(&LayerStack, usize) -> bool>,
    pub clearerr: Option<fn(&mut LayerStack, usize)>,
    /// Ensure the layer's buffer exists.
    pub get_base: Option<fn(&mut LayerStack, usize)>,
    pub bufsiz: Option<fn(&LayerStack, usize) -> usize>,
    /// Current read cursor, as an offset into the layer's buffer.
    pub get_ptr: Option<fn(&LayerStack, usize) -> usize>,
    /// Bytes available between the read cursor and valid-data end.
    pub get_cnt: Option<fn(&LayerStack, usize) -> isize>,
    /// Unconsumed valid bytes, `buf[ptr..ptr+cnt]`.
    pub peek: Option<fn(&LayerStack, usize) -> &[u8]>,
    pub set_ptrcnt: Option<fn(&mut LayerStack, usize, usize, isize)>,
}

impl LayerDef {
    /// All-unset template for building static definitions.
    pub const EMPTY: LayerDef = LayerDef {
        name: "",
        size: 0,
        kind: 0,
        mk_state: None,
        pushed: None,
        popped: None,
        open: None,
        binmode: None,
        fileno: None,
        dup: None,
        read: None,
        unread: None,
        write: None,
        seek: None,
        tell: None,
        close: None,
        flush: None,
        fill: None,
        eof: None,
        error: None,
        clearerr: None,
        get_base: None,
        bufsiz: None,
        get_ptr: None,
        get_cnt: None,
        peek: None,
        set_ptrcnt: None,
    };
}

// ---------------------------------------------------------------------------
// Generic (base) operations
// ---------------------------------------------------------------------------

/// Default `pushed`: derive the capability flags from the mode string, or
/// inherit them from the layer below when no mode is given.
pub fn base_pushed(stack: &mut LayerStack, i: usize, mode: Option<&str>, _arg: Option<&str>) -> i32 {
    let fastgets = stack
        .slot(i)
        .def
        .map(|d| d.set_ptrcnt.is_some())
        .unwrap_or(false);
    let slot = stack.slot_mut(i);
    slot.flags &= !(F_CANREAD | F_CANWRITE | F_TRUNCATE | F_APPEND);
    if fastgets {
        slot.flags |= F_FASTGETS;
    }
    match mode {
        Some(mode) => {
            let mut chars = mode.chars();
            match chars.next() {
                Some('r') => slot.flags |= F_CANREAD,
                Some('a') => slot.flags |= F_APPEND | F_CANWRITE,
                Some('w') => slot.flags |= F_TRUNCATE | F_CANWRITE,
                _ => {
                    set_errno(libc::EINVAL);
                    return -1;
                }
            }
            for c in chars {
                match c {
                    '+' => slot.flags |= F_CANREAD | F_CANWRITE,
                    'b' => slot.flags &= !F_CRLF,
                    't' => slot.flags |= F_CRLF,
                    _ => {
                        set_errno(libc::EINVAL);
                        return -1;
                    }
                }
            }
        }
        None => {
            if let Some(below) = stack.next_below(i) {
                let inherited = stack.slot(below).flags
                    & (F_CANREAD | F_CANWRITE | F_TRUNCATE | F_APPEND);
                stack.slot_mut(i).flags |= inherited;
            }
        }
    }
    0
}

/// Default `popped`: nothing to release, let the stack free the slot.
pub fn base_popped(_stack: &mut LayerStack, _i: usize) -> i32 {
    0
}

/// Generic read over the ptr/cnt buffer protocol: consume what the layer
/// has buffered and `fill` at the boundary. Never assumes one fill
/// satisfies the request.
pub fn base_read(stack: &mut LayerStack, i: usize, out: &mut [u8]) -> isize {
    if stack.slot(i).flags & F_CANREAD == 0 {
        stack.slot_mut(i).flags |= F_ERROR;
        set_errno(libc::EBADF);
        stack.save_errno(i);
        return 0;
    }
    let mut done = 0;
    while done < out.len() {
        let avail = stack.get_cnt_at(i);
        if avail > 0 {
            let take = (avail as usize).min(out.len() - done);
            let ptr = stack.get_ptr_at(i);
            if let Some(src) = stack.peek_at(i) {
                out[done..done + take].copy_from_slice(&src[..take]);
            } else {
                break;
            }
            stack.set_ptrcnt_at(i, ptr + take, avail - take as isize);
            done += take;
        } else if stack.fill_at(i) != 0 {
            break;
        }
    }
    done as isize
}

/// Generic unread: stage the bytes in a pending layer pushed directly above
/// this one, preserving the position this layer currently reports.
pub fn base_unread(stack: &mut LayerStack, i: usize, data: &[u8]) -> isize {
    let old = stack.tell_at(i);
    let j = match stack.push_above(i, &pending::PENDING_DEF, Some("r"), None) {
        Some(j) => j,
        None => return -1,
    };
    if let Some(b) = stack.buf_state_mut(j) {
        b.posn = old;
    }
    buffer::buf_unread(stack, j, data)
}

/// Generic close: flush, drop capabilities, then close the first layer
/// below that knows how.
pub fn base_close(stack: &mut LayerStack, i: usize) -> i32 {
    let mut code = stack.flush_at(i);
    stack.slot_mut(i).flags &= !(F_CANREAD | F_CANWRITE | F_OPEN);
    let mut n = stack.next_below(i);
    while let Some(j) = n {
        if stack.slot(j).def.map(|d| d.close.is_some()).unwrap_or(false) {
            if stack.close_at(j) != 0 {
                code = -1;
            }
            break;
        }
        stack.slot_mut(j).flags &= !(F_CANREAD | F_CANWRITE | F_OPEN);
        n = stack.next_below(j);
    }
    code
}

pub fn base_eof(stack: &LayerStack, i: usize) -> bool {
    stack.slot(i).flags & F_EOF != 0
}

pub fn base_error(stack: &LayerStack, i: usize) -> bool {
    stack.slot(i).flags & F_ERROR != 0
}

pub fn base_clearerr(stack: &mut LayerStack, i: usize) {
    stack.slot_mut(i).flags &= !(F_ERROR | F_EOF);
    stack.slot_mut(i).err = 0;
}

/// Layers with no descriptor of their own report the one below.
pub fn base_fileno(stack: &LayerStack, i: usize) -> RawFd {
    match stack.next_below(i) {
        Some(j) => stack.fileno_at(j),
        None => -1,
    }
}

/// Default `binmode`: a RAW-capable layer stays (shedding UTF-8-ness),
/// anything else pops itself.
pub fn base_binmode(stack: &mut LayerStack, i: usize) -> i32 {
    if stack.slot(i).def.map(|d| d.kind & KIND_RAW != 0).unwrap_or(false) {
        stack.slot_mut(i).flags &= !F_UTF8;
    } else {
        stack.pop_at(i);
    }
    0
}

/// Default `open`: delegate opening to the layer below in the chain (the
/// bottom default when there is none), then push self on top.
pub fn base_open(chain: &[ChainLink], n: usize, mode: &str, target: &OpenTarget<'_>) -> Option<LayerStack> {
    let below = if n > 0 {
        chain[n - 1].def
    } else {
        &unix::UNIX_DEF
    };
    let open = match below.open {
        Some(open) => open,
        None => {
            set_errno(libc::EINVAL);
            return None;
        }
    };
    let mut stack = open(chain, n.saturating_sub(1), mode, target)?;
    let arg = chain.get(n).and_then(|l| l.arg.as_deref());
    let def = chain.get(n).map(|l| l.def)?;
    if stack.push(def, Some(mode), arg) != 0 {
        stack.close();
        return None;
    }
    Some(stack)
}

/// Default `dup`: push the same definition onto the new stack with a mode
/// string reconstructed from the old slot's flags.
pub fn base_dup(new: &mut LayerStack, old: &LayerStack, i: usize, _flags: u32) -> i32 {
    let def = match old.slot(i).def {
        Some(def) => def,
        None => return -1,
    };
    let mode = modestr(old.slot(i).flags);
    if new.push(def, Some(&mode), None) != 0 {
        return -1;
    }
    let top = new.top_index().expect("push succeeded");
    if old.slot(i).flags & F_UTF8 != 0 {
        new.slot_mut(top).flags |= F_UTF8;
    }
    0
}

/// Reconstruct an open-mode string from instance flags.
pub fn modestr(flags: u32) -> String {
    let mut s = String::with_capacity(2);
    if flags & F_APPEND != 0 {
        s.push('a');
        if flags & F_CANREAD != 0 {
            s.push('+');
        }
    } else if flags & F_CANREAD != 0 {
        s.push('r');
        if flags & F_CANWRITE != 0 {
            s.push('+');
        }
    } else if flags & F_CANWRITE != 0 {
        s.push('w');
    }
    s
}
