//! Reference Prefix Normalization
//!
//! Block names are free text in the editor ("My Agent 2"); references use a
//! canonical form ("myagent2"). The same function is applied to names, ids,
//! and the prefix of every scanned token so the three always agree.

/// Prefix of the designated entry block.
pub const START_PREFIX: &str = "start";

/// Prefix for loop iteration values and loop aggregates.
pub const LOOP_PREFIX: &str = "loop";

/// Prefix for parallel iteration values and parallel aggregates.
pub const PARALLEL_PREFIX: &str = "parallel";

/// Prefix for workflow variables.
pub const VARIABLE_PREFIX: &str = "variable";

/// System prefixes that resolve regardless of graph position.
pub const SYSTEM_PREFIXES: &[&str] = &[START_PREFIX, LOOP_PREFIX, PARALLEL_PREFIX, VARIABLE_PREFIX];

/// Normalizes a block name or id into its reference prefix.
///
/// Lower-cases, drops whitespace, and keeps only ASCII alphanumerics,
/// `_` and `-`.
///
/// # Example
///
/// ```
/// use blockrunner::references::normalize_name;
///
/// assert_eq!(normalize_name("My Agent 2"), "myagent2");
/// assert_eq!(normalize_name("fetch-data"), "fetch-data");
/// ```
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Returns true if the normalized prefix is one of the system prefixes.
pub fn is_system_prefix(prefix: &str) -> bool {
    SYSTEM_PREFIXES.contains(&prefix)
}
