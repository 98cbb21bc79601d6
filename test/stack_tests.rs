//! Integration Tests for the Layer Stack
//!
//! Tests the observable stack protocol through the public Handle API:
//! - Layer ordering from specification strings
//! - Pseudo layers (raw, pop, utf8/bytes)
//! - apply_layers and binmode reshaping an open handle
//! - Invalid-handle behavior after close

use std::fs;
use std::path::PathBuf;

use iostack::{Handle, StreamError};

fn temp_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("iostack_stack_{}_{}", std::process::id(), name));
    p
}

// =============================================================================
// Layer ordering
// =============================================================================

#[test]
fn test_spec_order_top_first() {
    let path = temp_path("order");
    let mut h = Handle::open_with("unix perlio crlf", &path, "w").unwrap();
    assert_eq!(h.layer_names(), ["crlf", "perlio", "unix"]);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_spec_without_bottom_gets_unix() {
    let path = temp_path("implicit_unix");
    let mut h = Handle::open_with("perlio", &path, "w").unwrap();
    assert_eq!(h.layer_names(), ["perlio", "unix"]);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_unix_alone() {
    let path = temp_path("bare");
    let mut h = Handle::open_with("unix", &path, "w").unwrap();
    assert_eq!(h.layer_names(), ["unix"]);
    assert!(h.fileno() >= 0);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

// =============================================================================
// Pseudo layers
// =============================================================================

#[test]
fn test_pop_pseudo_layer_removes_top() {
    let path = temp_path("pop");
    let mut h = Handle::open_with("unix perlio crlf", &path, "w").unwrap();
    h.apply_layers("pop", None).unwrap();
    assert_eq!(h.layer_names(), ["perlio", "unix"]);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_raw_pseudo_layer_strips_to_binary() {
    let path = temp_path("raw");
    let mut h = Handle::open_with("unix perlio crlf", &path, "w").unwrap();
    h.apply_layers("raw", None).unwrap();
    // crlf pops itself when asked to go binary; buffering stays.
    assert_eq!(h.layer_names(), ["perlio", "unix"]);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_utf8_and_bytes_are_stackless() {
    let path = temp_path("utf8");
    let mut h = Handle::open_with("unix perlio", &path, "w").unwrap();
    h.apply_layers("utf8", None).unwrap();
    assert_eq!(h.layer_names(), ["perlio", "unix"]);
    h.apply_layers("bytes", None).unwrap();
    assert_eq!(h.layer_names(), ["perlio", "unix"]);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

// =============================================================================
// binmode
// =============================================================================

#[test]
fn test_binmode_pops_crlf_layer() {
    let path = temp_path("binmode");
    let mut h = Handle::open_with("unix perlio crlf", &path, "w").unwrap();
    h.binmode().unwrap();
    assert_eq!(h.layer_names(), ["perlio", "unix"]);
    // A second binmode is harmless.
    h.binmode().unwrap();
    assert_eq!(h.layer_names(), ["perlio", "unix"]);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_crlf_on_crlf_reactivates_lower() {
    let path = temp_path("redundant_crlf");
    let mut h = Handle::open_with("unix perlio crlf crlf", &path, "w").unwrap();
    // The second crlf noticed the first and removed itself.
    assert_eq!(h.layer_names(), ["crlf", "perlio", "unix"]);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

// =============================================================================
// Close semantics
// =============================================================================

#[test]
fn test_operations_after_close_fail() {
    let path = temp_path("closed");
    let mut h = Handle::open_with("unix perlio", &path, "w").unwrap();
    h.write(b"x").unwrap();
    h.close().unwrap();
    assert!(matches!(h.close(), Err(StreamError::InvalidHandle)));
    assert!(h.write(b"y").is_err());
    assert!(h.layer_names().is_empty());
    assert_eq!(h.fileno(), -1);
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_drop_flushes_and_closes() {
    let path = temp_path("drop");
    {
        let mut h = Handle::open_with("unix perlio", &path, "w").unwrap();
        h.write(b"buffered until drop").unwrap();
    }
    assert_eq!(fs::read(&path).unwrap(), b"buffered until drop");
    fs::remove_file(&path).unwrap();
}
