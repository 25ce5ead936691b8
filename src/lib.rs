//! Workspace root package.
//!
//! The engine lives in `crates/*`; this package only anchors shared
//! developer tooling (git hooks via `cargo-husky`).
