//! HUDLink simulation harness.
//!
//! Drives `hudlink-core` against a simulated USB host: a scripted
//! operator grants (or denies) access to a HUD, walks a jittered
//! course while the link streams CoT fixes, and optionally unplugs the
//! HUD partway through.

pub mod config;
pub mod service;
pub mod track;
