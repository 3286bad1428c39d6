use serde::{Deserialize, Serialize};

/// News item served by the demo endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeNews {
    pub id: u32,
    pub title: String,
}

impl FakeNews {
    pub fn new(id: u32, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
        }
    }
}

/// Body accepted by `POST /news`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeNewsRequest {
    pub category: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}
