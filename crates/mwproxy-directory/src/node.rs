use serde::{Deserialize, Deserializer, Serialize};

/// A cluster member as reported by the directory API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub uuid: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub cluster_uuid: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub status: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub primary_ip: String,
}

/// Unset fields are reported as either missing or `null`
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Node {
    pub fn new(
        uuid: impl Into<String>,
        cluster_uuid: impl Into<String>,
        primary_ip: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            cluster_uuid: cluster_uuid.into(),
            status: String::new(),
            name: String::new(),
            primary_ip: primary_ip.into(),
        }
    }
}
