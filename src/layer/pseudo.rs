//! Pseudo layers: zero-state definitions whose entire job happens at push
//! time. None of them ever occupies a slot; their `pushed` hook receives
//! the current top layer and mutates the stack or its flags directly.

use super::stack::LayerStack;
use super::{LayerDef, F_CRLF, F_UTF8, KIND_DUMMY, KIND_RAW, KIND_UTF8};

/// `raw`: strip the stack down to a binary-clean state. Layers that are
/// not RAW-capable are asked to binmode themselves away, top down, until
/// a RAW layer is on top; that layer then sheds any text flags.
fn raw_pushed(stack: &mut LayerStack, _i: usize, _mode: Option<&str>, _arg: Option<&str>) -> i32 {
    while let Some(top) = stack.top_index() {
        let is_raw = stack
            .slot(top)
            .def
            .map(|d| d.kind & KIND_RAW != 0 && d.kind & KIND_DUMMY == 0)
            .unwrap_or(false);
        if is_raw && stack.slot(top).flags & F_CRLF == 0 {
            stack.slot_mut(top).flags &= !F_UTF8;
            return 0;
        }
        if stack.binmode_at(top) != 0 {
            return -1;
        }
        if stack.top_index() == Some(top) {
            // The layer neither translated nor popped; nothing more to do.
            stack.slot_mut(top).flags &= !(F_CRLF | F_UTF8);
            return 0;
        }
    }
    -1
}

/// `utf8` / `bytes`: toggle the UTF-8 tag on whatever layer is on top.
fn utf8_pushed(stack: &mut LayerStack, i: usize, _mode: Option<&str>, _arg: Option<&str>) -> i32 {
    stack.slot_mut(i).flags |= F_UTF8;
    0
}

fn bytes_pushed(stack: &mut LayerStack, i: usize, _mode: Option<&str>, _arg: Option<&str>) -> i32 {
    stack.slot_mut(i).flags &= !F_UTF8;
    0
}

/// `pop`: remove the current top layer. Useful in specs that adjust an
/// already-configured default chain.
fn pop_pushed(stack: &mut LayerStack, i: usize, _mode: Option<&str>, _arg: Option<&str>) -> i32 {
    stack.pop_at(i);
    0
}

pub static RAW_DEF: LayerDef = LayerDef {
    name: "raw",
    size: 0,
    kind: KIND_DUMMY | KIND_RAW,
    pushed: Some(raw_pushed),
    ..LayerDef::EMPTY
};

pub static UTF8_DEF: LayerDef = LayerDef {
    name: "utf8",
    size: 0,
    kind: KIND_DUMMY | KIND_UTF8 | KIND_RAW,
    pushed: Some(utf8_pushed),
    ..LayerDef::EMPTY
};

pub static BYTES_DEF: LayerDef = LayerDef {
    name: "bytes",
    size: 0,
    kind: KIND_DUMMY | KIND_RAW,
    pushed: Some(bytes_pushed),
    ..LayerDef::EMPTY
};

pub static POP_DEF: LayerDef = LayerDef {
    name: "pop",
    size: 0,
    kind: KIND_DUMMY | KIND_RAW,
    pushed: Some(pop_pushed),
    ..LayerDef::EMPTY
};
