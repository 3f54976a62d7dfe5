//! Build script for strdedup.
//!
//! Reports enabled features and warns about targets the agent module has
//! not been validated on.

use std::env;

fn main() {
    // Re-run if features change
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_PARKING_LOT");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DIAGNOSTICS");

    let parking_lot_enabled = env::var("CARGO_FEATURE_PARKING_LOT").is_ok();
    let diagnostics_enabled = env::var("CARGO_FEATURE_DIAGNOSTICS").is_ok();

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let is_release = profile == "release";

    // =========================================================================
    // Feature-specific diagnostics
    // =========================================================================

    if diagnostics_enabled {
        emit_info("Diagnostics mirrored to stderr");
        if is_release {
            emit_warning("'diagnostics' enabled in a release build!");
            emit_note("The agent will write to the host process's stderr.");
        }
    }

    if is_release && !parking_lot_enabled {
        emit_note("Tip: enable 'parking_lot' for cheaper shard locks on the allocation path:");
        emit_note("  strdedup = { version = \"0.1\", features = [\"parking_lot\"] }");
    }

    // =========================================================================
    // Environment checks
    // =========================================================================

    check_target();
}

// =============================================================================
// Diagnostic emission helpers
// =============================================================================

fn emit_info(msg: &str) {
    println!("cargo:warning=[strdedup] {}", msg);
}

fn emit_note(msg: &str) {
    println!("cargo:warning=[strdedup]    {}", msg);
}

fn emit_warning(msg: &str) {
    println!("cargo:warning=[strdedup] warning: {}", msg);
}

// =============================================================================
// Target checks
// =============================================================================

fn check_target() {
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let pointer_width = env::var("CARGO_CFG_TARGET_POINTER_WIDTH").unwrap_or_default();

    if pointer_width != "64" {
        emit_warning("32-bit target detected");
        emit_note("StringLayout::UTF16_X64 assumes 8-byte object headers;");
        emit_note("pass the runtime's own layout through the host vtable.");
    }

    if arch == "wasm32" {
        emit_warning("WebAssembly target detected");
        emit_note("There is no profiling interface to attach to; only the simulated host is usable.");
    }

    if !matches!(os.as_str(), "windows" | "linux" | "macos" | "") {
        emit_note(&format!("Untested target OS '{}': attach may report UnsupportedPlatform.", os));
    }
}
