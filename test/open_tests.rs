//! Integration Tests for the Open Pipeline and Registry
//!
//! Tests specification parsing and resolution at open time:
//! - Whole-spec failure on unknown names and malformed args
//! - Mode string validation
//! - Layer arguments reaching their layer
//! - Default-chain configuration and teardown
//! - Lazy layer provider registration

use std::fs;
use std::path::PathBuf;

use iostack::layer::LayerDef;
use iostack::{registry, Handle, StreamError};

fn temp_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("iostack_open_{}_{}", std::process::id(), name));
    p
}

// =============================================================================
// Spec errors
// =============================================================================

#[test]
fn test_unknown_layer_fails_whole_open() {
    let path = temp_path("unknown");
    let res = Handle::open_with("unix nosuchlayer perlio", &path, "w");
    assert!(matches!(res, Err(StreamError::UnknownLayer(name)) if name == "nosuchlayer"));
    // Nothing was applied: the file was never created.
    assert!(!path.exists());
}

#[test]
fn test_unterminated_arg_fails_open() {
    let path = temp_path("unterminated");
    let res = Handle::open_with("unix perlio(4096", &path, "w");
    assert!(matches!(res, Err(StreamError::UnterminatedArg(name)) if name == "perlio"));
    assert!(!path.exists());
}

#[test]
fn test_bad_separator_fails_open() {
    let path = temp_path("separator");
    let res = Handle::open_with("unix;perlio", &path, "w");
    assert!(matches!(res, Err(StreamError::BadSeparator(';'))));
    assert!(!path.exists());
}

#[test]
fn test_bad_mode_rejected_before_os_open() {
    let path = temp_path("badmode");
    assert!(matches!(
        Handle::open_with("unix perlio", &path, "x"),
        Err(StreamError::BadMode(m)) if m == "x"
    ));
    assert!(matches!(
        Handle::open_with("unix perlio", &path, "r#"),
        Err(StreamError::BadMode(_))
    ));
    assert!(!path.exists());
}

#[test]
fn test_missing_file_reports_os_error() {
    let res = Handle::open_with("unix perlio", "/nonexistent/dir/iostack_missing", "r");
    match res {
        Err(StreamError::Os(e)) => assert_eq!(e.raw_os_error(), Some(libc::ENOENT)),
        other => panic!("expected ENOENT, got {:?}", other.map(|_| ())),
    }
}

// =============================================================================
// Layer arguments
// =============================================================================

#[test]
fn test_numeric_arg_sets_buffer_size() {
    let path = temp_path("bufarg");
    fs::write(&path, vec![b'q'; 64]).unwrap();
    // A five-byte buffer shows up as reads capped per fill.
    let mut h = Handle::open_with("unix perlio(5)", &path, "r").unwrap();
    let mut buf = [0u8; 64];
    let n = h.read(&mut buf).unwrap();
    assert_eq!(n, 64);
    assert!(buf[..n].iter().all(|&c| c == b'q'));
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

// =============================================================================
// Colon syntax
// =============================================================================

#[test]
fn test_colon_separated_spec() {
    let path = temp_path("colons");
    let mut h = Handle::open_with(":unix:perlio:crlf", &path, "w").unwrap();
    assert_eq!(h.layer_names(), ["crlf", "perlio", "unix"]);
    h.close().unwrap();
    fs::remove_file(&path).unwrap();
}

// =============================================================================
// Registry configuration
// =============================================================================

// Registry state is process-global, so everything that mutates it runs
// inside one test.
#[test]
fn test_registry_configuration_lifecycle() {
    registry::set_default_spec("unix perlio crlf").unwrap();
    let chain = registry::default_chain().unwrap();
    let names: Vec<_> = chain.iter().map(|l| l.def.name).collect();
    assert_eq!(names, ["unix", "perlio", "crlf"]);

    // A bad spec is rejected and the old one stays.
    assert!(registry::set_default_spec("unix bogus").is_err());
    let chain = registry::default_chain().unwrap();
    assert_eq!(chain.len(), 3);

    // Teardown resets to the built-in default at next use.
    registry::teardown();
    let chain = registry::default_chain().unwrap();
    let names: Vec<_> = chain.iter().map(|l| l.def.name).collect();
    assert!(names == ["unix", "perlio"] || std::env::var("IOSTACK").is_ok());

    // Lazy provider: consulted once on a miss, then cached.
    static SHOUTY_DEF: LayerDef = LayerDef {
        name: "shouty",
        size: 0,
        kind: iostack::layer::KIND_DUMMY | iostack::layer::KIND_RAW,
        ..LayerDef::EMPTY
    };

    fn provider(name: &str) -> Option<&'static LayerDef> {
        (name == "shouty").then_some(&SHOUTY_DEF)
    }

    registry::set_layer_provider(provider);
    let chain = registry::resolve("unix perlio shouty").unwrap();
    assert_eq!(chain[2].def.name, "shouty");
    // Second lookup hits the cache, not the provider.
    assert!(registry::resolve("shouty").is_ok());
    // Still a miss for anything the provider declines.
    assert!(registry::resolve("whispery").is_err());
}
