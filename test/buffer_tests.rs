//! Integration Tests for the Buffer Layer
//!
//! Tests the fill/flush state machine against real files:
//! - Binary round-trip identity
//! - Buffer-boundary crossing reads and writes
//! - tell/seek reconciliation between logical and OS position
//! - unread (push-back) including pending-layer overflow
//! - Append-mode position re-sync
//! - Flush behavior on non-seekable streams (pipes)

use std::fs;
use std::io::SeekFrom;
use std::path::PathBuf;

use iostack::Handle;

fn temp_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("iostack_buf_{}_{}", std::process::id(), name));
    p
}

fn pipe_pair() -> (libc::c_int, libc::c_int) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

// =============================================================================
// Round-trip identity
// =============================================================================

#[test]
fn test_binary_round_trip_identity() {
    let path = temp_path("roundtrip");
    let data: Vec<u8> = (0..=255u8).cycle().take(40_000).collect();

    let mut w = Handle::open_with("unix perlio", &path, "w").unwrap();
    assert_eq!(w.write(&data).unwrap(), data.len());
    w.close().unwrap();

    let mut r = Handle::open_with("unix perlio", &path, "r").unwrap();
    let mut back = vec![0u8; data.len() + 16];
    let mut got = 0;
    loop {
        let n = r.read(&mut back[got..]).unwrap();
        if n == 0 {
            break;
        }
        got += n;
    }
    assert_eq!(got, data.len());
    assert_eq!(&back[..got], &data[..]);
    assert!(r.eof());
    r.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_small_buffer_crosses_boundaries() {
    let path = temp_path("tiny");
    let data = b"0123456789abcdefghij";

    // perlio(7): seven-byte buffer forces several fill/flush cycles.
    let mut w = Handle::open_with("unix perlio(7)", &path, "w").unwrap();
    assert_eq!(w.write(data).unwrap(), data.len());
    w.close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), data);

    let mut r = Handle::open_with("unix perlio(7)", &path, "r").unwrap();
    let mut back = [0u8; 20];
    let mut got = 0;
    while got < back.len() {
        let n = r.read(&mut back[got..]).unwrap();
        if n == 0 {
            break;
        }
        got += n;
    }
    assert_eq!(&back[..got], data);
    r.close().unwrap();
    fs::remove_file(&path).unwrap();
}

// =============================================================================
// tell / seek
// =============================================================================

#[test]
fn test_tell_tracks_logical_position() {
    let path = temp_path("tell");
    fs::write(&path, b"abcdefgh").unwrap();

    let mut h = Handle::open_with("unix perlio", &path, "r").unwrap();
    assert_eq!(h.tell().unwrap(), 0);
    let mut buf = [0u8; 3];
    h.read(&mut buf).unwrap();
    // The OS position is 8 (whole file buffered); logically we are at 3.
    assert_eq!(h.tell().unwrap(), 3);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_seek_discards_buffer_and_resyncs() {
    let path = temp_path("seek");
    fs::write(&path, b"abcdefgh").unwrap();

    let mut h = Handle::open_with("unix perlio", &path, "r").unwrap();
    let mut buf = [0u8; 2];
    h.read(&mut buf).unwrap();
    assert_eq!(&buf, b"ab");
    h.seek(SeekFrom::Start(6)).unwrap();
    assert_eq!(h.tell().unwrap(), 6);
    h.read(&mut buf).unwrap();
    assert_eq!(&buf, b"gh");
    h.seek(SeekFrom::Current(-4)).unwrap();
    assert_eq!(h.tell().unwrap(), 4);
    h.read(&mut buf).unwrap();
    assert_eq!(&buf, b"ef");
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_flush_of_partly_read_buffer_seeks_back() {
    let path = temp_path("giveback");
    fs::write(&path, b"abcdefgh").unwrap();

    let mut h = Handle::open_with("unix perlio", &path, "r").unwrap();
    let mut buf = [0u8; 3];
    h.read(&mut buf).unwrap();
    // Flush gives unconsumed bytes back to the fd: its position must land
    // on our logical one.
    h.flush().unwrap();
    assert_eq!(h.tell().unwrap(), 3);
    h.read(&mut buf).unwrap();
    assert_eq!(&buf, b"def");
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_read_write_handle_flushes_between_modes() {
    let path = temp_path("rw");
    fs::write(&path, b"xxxxxxxx").unwrap();

    let mut h = Handle::open_with("unix perlio", &path, "r+").unwrap();
    let mut buf = [0u8; 4];
    h.read(&mut buf).unwrap();
    h.seek(SeekFrom::Start(0)).unwrap();
    h.write(b"yy").unwrap();
    h.seek(SeekFrom::Start(0)).unwrap();
    let mut all = [0u8; 8];
    let n = h.read(&mut all).unwrap();
    assert_eq!(&all[..n], b"yyxxxxxx");
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

// =============================================================================
// Append mode
// =============================================================================

#[test]
fn test_append_mode_resyncs_tell() {
    let path = temp_path("append");
    fs::write(&path, b"12345").unwrap();

    let mut h = Handle::open_with("unix perlio", &path, "a").unwrap();
    h.write(b"678").unwrap();
    // O_APPEND: tell flushes and asks the fd where the write landed.
    assert_eq!(h.tell().unwrap(), 8);
    h.close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"12345678");
    fs::remove_file(&path).unwrap();
}

// =============================================================================
// unread
// =============================================================================

#[test]
fn test_unread_rewinds_consumed_bytes() {
    let path = temp_path("unread");
    fs::write(&path, b"abcdefgh").unwrap();

    let mut h = Handle::open_with("unix perlio", &path, "r").unwrap();
    let mut buf = [0u8; 4];
    h.read(&mut buf).unwrap();
    assert_eq!(&buf, b"abcd");
    assert_eq!(h.unread(b"cd").unwrap(), 2);
    assert_eq!(h.tell().unwrap(), 2);
    h.read(&mut buf).unwrap();
    assert_eq!(&buf, b"cdef");
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_unread_different_bytes_than_read() {
    let path = temp_path("unread_subst");
    fs::write(&path, b"abcd").unwrap();

    let mut h = Handle::open_with("unix perlio", &path, "r").unwrap();
    let mut buf = [0u8; 2];
    h.read(&mut buf).unwrap();
    assert_eq!(h.unread(b"XY").unwrap(), 2);
    let mut all = [0u8; 4];
    let mut got = 0;
    while got < all.len() {
        let n = h.read(&mut all[got..]).unwrap();
        if n == 0 {
            break;
        }
        got += n;
    }
    assert_eq!(&all[..got], b"XYcd");
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_unread_before_any_read() {
    let path = temp_path("unread_fresh");
    fs::write(&path, b"tail").unwrap();

    let mut h = Handle::open_with("unix perlio", &path, "r").unwrap();
    assert_eq!(h.unread(b"head ").unwrap(), 5);
    let mut all = [0u8; 9];
    let mut got = 0;
    while got < all.len() {
        let n = h.read(&mut all[got..]).unwrap();
        if n == 0 {
            break;
        }
        got += n;
    }
    assert_eq!(&all[..got], b"head tail");
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_unread_overflow_stages_in_pending_layer() {
    let path = temp_path("unread_pending");
    fs::write(&path, b"ffff").unwrap();

    // unix alone has no buffer at all: any unread goes through the
    // generic path, which stages it in a pending layer above unix.
    let mut h = Handle::open_with("unix", &path, "r").unwrap();
    assert_eq!(h.unread(b"pp").unwrap(), 2);
    assert_eq!(h.layer_names(), ["pending", "unix"]);

    let mut all = [0u8; 6];
    let mut got = 0;
    while got < all.len() {
        let n = h.read(&mut all[got..]).unwrap();
        if n == 0 {
            break;
        }
        got += n;
    }
    assert_eq!(&all[..got], b"ppffff");
    // Drained pending layer removed itself.
    assert_eq!(h.layer_names(), ["unix"]);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_unread_clears_eof() {
    let path = temp_path("unread_eof");
    fs::write(&path, b"z").unwrap();

    let mut h = Handle::open_with("unix perlio", &path, "r").unwrap();
    let mut buf = [0u8; 4];
    let n = h.read(&mut buf).unwrap();
    assert_eq!(n, 1);
    assert_eq!(h.read(&mut buf).unwrap(), 0);
    assert!(h.eof());
    h.unread(b"z").unwrap();
    assert!(!h.eof());
    assert_eq!(h.read(&mut buf).unwrap(), 1);
    assert_eq!(buf[0], b'z');
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

// =============================================================================
// Non-seekable streams
// =============================================================================

#[test]
fn test_flush_keeps_buffer_on_nonseekable_stream() {
    let (rd, wr) = pipe_pair();
    assert_eq!(
        unsafe { libc::write(wr, b"abcdef".as_ptr().cast(), 6) },
        6
    );

    let mut h = Handle::from_fd(rd, "r").unwrap();
    let mut one = [0u8; 1];
    assert_eq!(h.read(&mut one).unwrap(), 1);
    assert_eq!(one[0], b'a');

    // A pipe cannot seek back, so flush must leave the five buffered
    // bytes in place rather than drop them.
    h.flush().unwrap();
    assert_eq!(h.tell().unwrap(), 1);

    assert_eq!(unsafe { libc::write(wr, b"XYZ".as_ptr().cast(), 3) }, 3);

    let mut rest = [0u8; 5];
    assert_eq!(h.read(&mut rest).unwrap(), 5);
    assert_eq!(&rest, b"bcdef");

    let mut fresh = [0u8; 3];
    assert_eq!(h.read(&mut fresh).unwrap(), 3);
    assert_eq!(&fresh, b"XYZ");

    h.close().unwrap();
    unsafe { libc::close(wr) };
}

#[test]
fn test_failed_flush_sets_queryable_error_flag() {
    // Writing into the read end of a pipe fails at the fd, but the
    // failure only surfaces when the buffer drains.
    let (rd, wr) = pipe_pair();
    let mut h = Handle::from_fd(rd, "w").unwrap();
    assert_eq!(h.write(b"boom").unwrap(), 4);
    assert!(!h.error());

    assert!(h.flush().is_err());
    assert!(h.error());

    h.clearerr();
    assert!(!h.error());
    h.close().unwrap();
    unsafe { libc::close(wr) };
}

// =============================================================================
// Error state
// =============================================================================

#[test]
fn test_write_to_readonly_handle_reports_error() {
    let path = temp_path("readonly");
    fs::write(&path, b"data").unwrap();

    let mut h = Handle::open_with("unix perlio", &path, "r").unwrap();
    assert!(h.write(b"nope").is_err());
    h.clearerr();
    assert!(!h.error());
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}
