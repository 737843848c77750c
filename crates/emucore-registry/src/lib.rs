//! Authoritative store of installable emulator cores and their lifecycle state.

mod descriptor;
mod notify;
mod store_json;
mod version;

pub use descriptor::*;
pub use notify::*;
pub use store_json::*;
pub use version::*;
