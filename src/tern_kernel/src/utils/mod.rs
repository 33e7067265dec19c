//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise. It's exposed only because it's needed by the port crates and the
//! `use_port!`-style configuration macros.
mod init;
pub mod intrusive_list;
mod prio_bitmap;

pub use self::{init::*, prio_bitmap::*};
