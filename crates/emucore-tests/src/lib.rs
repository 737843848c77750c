//! Cross-crate scenario tests for the core registry and updater.
