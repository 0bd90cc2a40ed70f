//! Code generation options.

use std::env;

/// Switches that change what the backend emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenOptions {
    /// Collapse no-op instructions to zero bytes during assembly.
    pub optimize: bool,
    /// Turn every warning into a user-facing error.
    pub warnings_as_errors: bool,
    /// Emit `Comment` markers describing lowered operations.
    pub emit_comments: bool,
    /// Emit `DebugLocation` markers when named values move.
    pub emit_debug_locations: bool,
    /// Check allocator invariants after every operation.
    pub verify: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            warnings_as_errors: false,
            emit_comments: false,
            emit_debug_locations: true,
            verify: cfg!(debug_assertions),
        }
    }
}

impl CodegenOptions {
    /// Defaults overridden by `VMGEN_*` environment variables.
    ///
    /// Each variable accepts `1`/`true`/`on` or `0`/`false`/`off`; anything
    /// else keeps the default.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        read_flag("VMGEN_OPT", &mut options.optimize);
        read_flag("VMGEN_WERROR", &mut options.warnings_as_errors);
        read_flag("VMGEN_COMMENTS", &mut options.emit_comments);
        read_flag("VMGEN_DEBUG_LOCATIONS", &mut options.emit_debug_locations);
        read_flag("VMGEN_VERIFY", &mut options.verify);
        options
    }
}

fn read_flag(name: &str, slot: &mut bool) {
    let Ok(raw) = env::var(name) else {
        return;
    };
    match parse_flag(&raw) {
        Some(value) => *slot = value,
        None => log::warn!("ignoring {name}={raw:?}: expected a boolean"),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
