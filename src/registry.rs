//! Process-wide layer registry and default chain.
//!
//! Holds every known [`LayerDef`], the configured default layer chain,
//! and the parser for layer specification strings. The registry is
//! initialize-on-first-use behind a lock rather than a bare global, and
//! embedders that tear the runtime down can call [`teardown`]; the next
//! use re-initializes from scratch.
//!
//! Specification syntax: colon- or whitespace-separated tokens of the
//! form `name` or `name(arg)`. Names start with an identifier character;
//! arguments may contain balanced parentheses and backslash escapes. An
//! unknown name or an unterminated argument list fails the whole parse,
//! never a prefix of it.

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::StreamError;
use crate::layer::buffer::BUF_DEF;
use crate::layer::crlf::CRLF_DEF;
use crate::layer::pending::PENDING_DEF;
use crate::layer::pseudo::{BYTES_DEF, POP_DEF, RAW_DEF, UTF8_DEF};
use crate::layer::unix::UNIX_DEF;
use crate::layer::{ChainLink, LayerDef};

/// Environment variable consulted for the default layer chain.
pub const ENV_DEFAULT_SPEC: &str = "IOSTACK";

/// Consulted on a lookup miss, so layers implemented outside the core can
/// be registered lazily by name.
pub type LayerProvider = fn(&str) -> Option<&'static LayerDef>;

struct Registry {
    defs: Vec<&'static LayerDef>,
    default_spec: Option<String>,
    provider: Option<LayerProvider>,
    initialized: bool,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    RwLock::new(Registry {
        defs: Vec::new(),
        default_spec: None,
        provider: None,
        initialized: false,
    })
});

fn ensure_init(reg: &mut Registry) {
    if reg.initialized {
        return;
    }
    reg.defs = vec![
        &UNIX_DEF,
        &BUF_DEF,
        &CRLF_DEF,
        &PENDING_DEF,
        &RAW_DEF,
        &UTF8_DEF,
        &BYTES_DEF,
        &POP_DEF,
    ];
    if reg.default_spec.is_none() {
        reg.default_spec = std::env::var(ENV_DEFAULT_SPEC).ok();
    }
    reg.initialized = true;
    log::debug!(
        "registry: initialized with {} layers, default spec {:?}",
        reg.defs.len(),
        reg.default_spec
    );
}

/// Register a layer definition, replacing any existing one of the same
/// name.
pub fn define_layer(def: &'static LayerDef) {
    let mut reg = REGISTRY.write();
    ensure_init(&mut reg);
    reg.defs.retain(|d| d.name != def.name);
    reg.defs.push(def);
}

/// Look a layer up by name, consulting the provider hook on a miss and
/// caching what it returns.
pub fn find_layer(name: &str) -> Option<&'static LayerDef> {
    {
        let mut reg = REGISTRY.write();
        ensure_init(&mut reg);
        if let Some(def) = reg.defs.iter().find(|d| d.name == name).copied() {
            return Some(def);
        }
    }
    let provider = REGISTRY.read().provider;
    if let Some(provider) = provider {
        if let Some(def) = provider(name) {
            define_layer(def);
            return Some(def);
        }
    }
    None
}

/// Install the lazy lookup hook for out-of-core layers.
pub fn set_layer_provider(provider: LayerProvider) {
    let mut reg = REGISTRY.write();
    ensure_init(&mut reg);
    reg.provider = Some(provider);
}

/// Override the default chain specification (takes precedence over the
/// environment). Validated eagerly so a bad spec fails here, not at the
/// next open.
pub fn set_default_spec(spec: &str) -> Result<(), StreamError> {
    resolve(spec)?;
    let mut reg = REGISTRY.write();
    ensure_init(&mut reg);
    reg.default_spec = Some(spec.to_string());
    Ok(())
}

/// Drop all registry state. For embedders shutting the runtime down; any
/// later use re-initializes.
pub fn teardown() {
    let mut reg = REGISTRY.write();
    reg.defs = Vec::new();
    reg.default_spec = None;
    reg.provider = None;
    reg.initialized = false;
}

/// The default chain for a fresh handle: `unix` + `perlio`, unless the
/// process configuration (env `IOSTACK` or [`set_default_spec`]) says
/// otherwise. A broken configured spec is reported, not silently patched.
pub fn default_chain() -> Result<Vec<ChainLink>, StreamError> {
    let spec = {
        let mut reg = REGISTRY.write();
        ensure_init(&mut reg);
        reg.default_spec.clone()
    };
    match spec {
        Some(spec) => resolve(&spec),
        None => Ok(vec![
            ChainLink {
                def: &UNIX_DEF,
                arg: None,
            },
            ChainLink {
                def: &BUF_DEF,
                arg: None,
            },
        ]),
    }
}

/// One parsed `name(arg)` token.
#[derive(Debug, PartialEq, Eq)]
pub struct SpecToken {
    pub name: String,
    pub arg: Option<String>,
}

/// Parse a specification string into tokens without resolving the names.
pub fn parse_spec(spec: &str) -> Result<Vec<SpecToken>, StreamError> {
    let mut tokens = Vec::new();
    let bytes = spec.as_bytes();
    let mut at = 0;
    while at < bytes.len() {
        let c = bytes[at];
        if c == b':' || c.is_ascii_whitespace() {
            at += 1;
            continue;
        }
        if !(c.is_ascii_alphanumeric() || c == b'_') {
            return Err(StreamError::BadSeparator(c as char));
        }
        let start = at;
        while at < bytes.len() && (bytes[at].is_ascii_alphanumeric() || bytes[at] == b'_') {
            at += 1;
        }
        let name = spec[start..at].to_string();
        let mut arg = None;
        if at < bytes.len() && bytes[at] == b'(' {
            let astart = at + 1;
            let mut depth = 1;
            at += 1;
            while at < bytes.len() {
                match bytes[at] {
                    b'\\' => at += 1,
                    b'(' => depth += 1,
                    b')' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                at += 1;
            }
            if depth != 0 || at >= bytes.len() {
                return Err(StreamError::UnterminatedArg(name));
            }
            arg = Some(spec[astart..at].to_string());
            at += 1; // past ')'
        }
        tokens.push(SpecToken { name, arg });
    }
    Ok(tokens)
}

/// Parse and resolve a specification into a chain of layer definitions.
/// Fails as a whole on the first unknown name; nothing is applied.
pub fn resolve(spec: &str) -> Result<Vec<ChainLink>, StreamError> {
    let mut chain = Vec::new();
    for token in parse_spec(spec)? {
        let def = find_layer(&token.name)
            .ok_or_else(|| StreamError::UnknownLayer(token.name.clone()))?;
        chain.push(ChainLink {
            def,
            arg: token.arg,
        });
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_names() {
        let t = parse_spec("unix perlio crlf").unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t[0].name, "unix");
        assert_eq!(t[2].name, "crlf");
        assert!(t.iter().all(|t| t.arg.is_none()));
    }

    #[test]
    fn parse_colon_separated() {
        let t = parse_spec(":unix:perlio").unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t[1].name, "perlio");
    }

    #[test]
    fn parse_args_with_nesting_and_escapes() {
        let t = parse_spec("perlio(4096) crlf(a(b)c) unix(x\\)y)").unwrap();
        assert_eq!(t[0].arg.as_deref(), Some("4096"));
        assert_eq!(t[1].arg.as_deref(), Some("a(b)c"));
        assert_eq!(t[2].arg.as_deref(), Some("x\\)y"));
    }

    #[test]
    fn parse_unterminated_arg_fails() {
        assert!(matches!(
            parse_spec("perlio(4096"),
            Err(StreamError::UnterminatedArg(name)) if name == "perlio"
        ));
    }

    #[test]
    fn parse_bad_separator_fails() {
        assert!(matches!(
            parse_spec("unix,perlio"),
            Err(StreamError::BadSeparator(','))
        ));
    }

    #[test]
    fn resolve_unknown_layer_fails_whole_spec() {
        assert!(matches!(
            resolve("unix nosuch perlio"),
            Err(StreamError::UnknownLayer(name)) if name == "nosuch"
        ));
    }

    #[test]
    fn resolve_known_chain() {
        let chain = resolve("unix perlio crlf").unwrap();
        let names: Vec<_> = chain.iter().map(|l| l.def.name).collect();
        assert_eq!(names, ["unix", "perlio", "crlf"]);
    }
}
