//! Reference Resolution Module
//!
//! Blocks read each other's outputs through textual tokens embedded in
//! their config (`<agent.content>`, `{{API_KEY}}`).
//!
//! - [`normalize`]: canonical reference prefixes and the system prefixes
//! - [`access`]: which nodes a block may reference
//! - [`resolver`]: token scanning and substitution

pub mod access;
pub mod normalize;
pub mod resolver;

pub use access::AccessibleSet;
pub use normalize::{normalize_name, SYSTEM_PREFIXES};
pub use resolver::{Lookup, ReferenceResolver};
