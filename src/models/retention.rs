use serde::Deserialize;

/// Prune rule: delete everything matching `predicate` older than `keep_last` days.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetentionRule {
    pub name: String,
    /// Store delete predicate, e.g. `_measurement="power"`.
    pub predicate: String,
    #[serde(default = "default_keep_last")]
    pub keep_last: u32,
}

fn default_keep_last() -> u32 {
    30
}
