use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Final aggregate for one user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PerUserSummary {
    pub user_id: String,
    pub page_views: u64,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub min_bytes: u64,
}

impl PerUserSummary {
    /// String keyed representation, one entry per field.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::with_capacity(5);
        map.insert("user_id".into(), Value::from(self.user_id.as_str()));
        map.insert("page_views".into(), Value::from(self.page_views));
        map.insert("total_bytes".into(), Value::from(self.total_bytes));
        map.insert("max_bytes".into(), Value::from(self.max_bytes));
        map.insert("min_bytes".into(), Value::from(self.min_bytes));
        map
    }
}
