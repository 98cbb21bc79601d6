//! Bottom layer over a raw Unix file descriptor.
//!
//! All OS calls that can block run inside an EINTR retry loop: after an
//! interrupt the process-wide async-check hook runs (it may tear this very
//! handle down), and the loop re-validates its own slot before retrying.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;

use crate::error::{last_errno, set_errno};
use crate::fdtable;

use super::stack::LayerStack;
use super::{
    base_close, base_dup, base_pushed, ChainLink, LayerDef, LayerState, OpenTarget, DUP_FD,
    F_APPEND, F_CANREAD, F_EOF, F_ERROR, F_OPEN, KIND_RAW,
};

/// Private state: the descriptor and the open flags it was created with.
pub struct UnixState {
    pub fd: RawFd,
    pub oflags: i32,
}

fn unix_state(stack: &LayerStack, i: usize) -> &UnixState {
    match &stack.slot(i).state {
        LayerState::Unix(u) => u,
        _ => panic!("unix op dispatched against a non-unix slot"),
    }
}

/// Translate a mode string into open(2) flags. Trailing `b`/`t` hints are
/// accepted and ignored beyond validation; this layer is always binary.
pub fn oflags_for_mode(mode: &str) -> i32 {
    let bytes = mode.as_bytes();
    let mut oflags;
    let mut at = 1;
    match bytes.first() {
        Some(b'r') => {
            oflags = libc::O_RDONLY;
            if bytes.get(1) == Some(&b'+') {
                oflags = libc::O_RDWR;
                at = 2;
            }
        }
        Some(b'w') => {
            oflags = libc::O_CREAT | libc::O_TRUNC;
            if bytes.get(1) == Some(&b'+') {
                oflags |= libc::O_RDWR;
                at = 2;
            } else {
                oflags |= libc::O_WRONLY;
            }
        }
        Some(b'a') => {
            oflags = libc::O_CREAT | libc::O_APPEND;
            if bytes.get(1) == Some(&b'+') {
                oflags |= libc::O_RDWR;
                at = 2;
            } else {
                oflags |= libc::O_WRONLY;
            }
        }
        _ => {
            set_errno(libc::EINVAL);
            return -1;
        }
    }
    match bytes.get(at) {
        None => {}
        Some(b'b') | Some(b't') => at += 1,
        Some(_) => {}
    }
    if bytes.len() > at {
        set_errno(libc::EINVAL);
        return -1;
    }
    oflags
}

/// Record the descriptor on the slot and take a reference on it.
pub(crate) fn setfd(stack: &mut LayerStack, i: usize, fd: RawFd, oflags: i32) {
    if let LayerState::Unix(u) = &mut stack.slot_mut(i).state {
        u.fd = fd;
        u.oflags = oflags;
    }
    fdtable::refcnt_inc(fd);
}

fn unix_pushed(stack: &mut LayerStack, i: usize, mode: Option<&str>, arg: Option<&str>) -> i32 {
    let code = base_pushed(stack, i, mode, arg);
    if let Some(below) = stack.next_below(i) {
        // We never call down, so drain anything pending and adopt the
        // descriptor the lower stack was using.
        stack.flush_at(below);
        let fd = stack.fileno_at(below);
        let oflags = mode.map(oflags_for_mode).unwrap_or(-1);
        setfd(stack, i, fd, oflags);
    }
    stack.slot_mut(i).flags |= F_OPEN;
    code
}

fn unix_fileno(stack: &LayerStack, i: usize) -> RawFd {
    unix_state(stack, i).fd
}

fn unix_open(chain: &[ChainLink], _n: usize, mode: &str, target: &OpenTarget<'_>) -> Option<LayerStack> {
    let (fd, oflags) = match target {
        OpenTarget::Path(path) => {
            let oflags = oflags_for_mode(mode);
            if oflags == -1 {
                return None;
            }
            let cpath = CString::new(path.as_os_str().as_bytes()).ok()?;
            // Close-on-exec by default; sharing across exec is the
            // explicitly-requested exception, not the rule.
            let fd = unsafe { libc::open(cpath.as_ptr(), oflags | libc::O_CLOEXEC, 0o666) };
            if fd < 0 {
                return None;
            }
            (fd, oflags)
        }
        OpenTarget::Fd(fd) => (*fd, mode_oflags_or_default(mode)),
    };
    let _ = chain;
    let mut stack = LayerStack::new();
    // Always the bottom of a fresh stack, whether named in the chain or
    // reached as the open fallback.
    if stack.push(&UNIX_DEF, Some(mode), None) != 0 {
        if matches!(target, OpenTarget::Path(_)) {
            unsafe { libc::close(fd) };
        }
        return None;
    }
    let top = stack.top_index().expect("push succeeded");
    setfd(&mut stack, top, fd, oflags);
    stack.slot_mut(top).flags |= F_OPEN;
    if stack.slot(top).flags & F_APPEND != 0 {
        unix_seek(&mut stack, top, 0, libc::SEEK_END);
    }
    Some(stack)
}

fn mode_oflags_or_default(mode: &str) -> i32 {
    let oflags = oflags_for_mode(mode);
    if oflags == -1 {
        0
    } else {
        oflags
    }
}

fn unix_read(stack: &mut LayerStack, i: usize, buf: &mut [u8]) -> isize {
    if stack.slot(i).lock > 0 {
        // Already mid-operation on this very slot: abort ungracefully
        // rather than recurse into a blocked descriptor.
        return -1;
    }
    let fd = unix_state(stack, i).fd;
    if stack.slot(i).flags & F_CANREAD == 0 || stack.slot(i).flags & (F_EOF | F_ERROR) != 0 {
        return 0;
    }
    loop {
        let len = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if len >= 0 || last_errno() != libc::EINTR {
            if len < 0 {
                if last_errno() != libc::EAGAIN {
                    stack.slot_mut(i).flags |= F_ERROR;
                    stack.save_errno(i);
                }
            } else if len == 0 && !buf.is_empty() {
                stack.slot_mut(i).flags |= F_EOF;
                set_errno(0);
            }
            return len as isize;
        }
        if stack.async_run(i) {
            set_errno(libc::EINTR);
            return -1;
        }
    }
}

fn unix_write(stack: &mut LayerStack, i: usize, buf: &[u8]) -> isize {
    if stack.slot(i).lock > 0 {
        return -1;
    }
    let fd = unix_state(stack, i).fd;
    loop {
        let len = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if len >= 0 || last_errno() != libc::EINTR {
            if len < 0 && last_errno() != libc::EAGAIN {
                stack.slot_mut(i).flags |= F_ERROR;
                stack.save_errno(i);
            }
            return len as isize;
        }
        if stack.async_run(i) {
            set_errno(libc::EINTR);
            return -1;
        }
    }
}

fn unix_seek(stack: &mut LayerStack, i: usize, offset: i64, whence: i32) -> i32 {
    let fd = unix_state(stack, i).fd;
    let new_loc = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
    if new_loc == -1 {
        return -1;
    }
    stack.slot_mut(i).flags &= !F_EOF;
    0
}

fn unix_tell(stack: &mut LayerStack, i: usize) -> i64 {
    let fd = unix_state(stack, i).fd;
    unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) as i64 }
}

fn unix_close(stack: &mut LayerStack, i: usize) -> i32 {
    let fd = unix_state(stack, i).fd;
    let mut code;
    if stack.slot(i).flags & F_OPEN != 0 {
        code = base_close(stack, i);
        if fdtable::refcnt_dec(fd) > 0 {
            // Someone else still references the descriptor; our close is
            // done once the buffers above have been flushed.
            stack.slot_mut(i).flags &= !F_OPEN;
            return 0;
        }
    } else {
        set_errno(libc::EBADF);
        return -1;
    }
    while unsafe { libc::close(fd) } != 0 {
        if last_errno() != libc::EINTR {
            code = -1;
            break;
        }
        if stack.async_run(i) {
            set_errno(libc::EINTR);
            return -1;
        }
    }
    if code == 0 {
        stack.slot_mut(i).flags &= !F_OPEN;
    }
    code
}

fn unix_dup(new: &mut LayerStack, old: &LayerStack, i: usize, flags: u32) -> i32 {
    let os = unix_state(old, i);
    let oflags = os.oflags;
    let fd = if flags & DUP_FD != 0 {
        let fd = unsafe { libc::fcntl(os.fd, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return -1;
        }
        fd
    } else {
        os.fd
    };
    if base_dup(new, old, i, flags) != 0 {
        if flags & DUP_FD != 0 {
            unsafe { libc::close(fd) };
        }
        return -1;
    }
    let top = new.top_index().expect("dup pushed a layer");
    setfd(new, top, fd, oflags);
    new.slot_mut(top).flags |= F_OPEN;
    0
}

pub static UNIX_DEF: LayerDef = LayerDef {
    name: "unix",
    size: std::mem::size_of::<UnixState>(),
    kind: KIND_RAW,
    mk_state: Some(|| LayerState::Unix(UnixState { fd: -1, oflags: 0 })),
    pushed: Some(unix_pushed),
    open: Some(unix_open),
    fileno: Some(unix_fileno),
    dup: Some(unix_dup),
    read: Some(unix_read),
    write: Some(unix_write),
    seek: Some(unix_seek),
    tell: Some(unix_tell),
    close: Some(unix_close),
    ..LayerDef::EMPTY
};
