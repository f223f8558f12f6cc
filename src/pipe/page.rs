use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Rendered output of a pipe `write`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageOutput {
    Text(String),
    Page {
        markdown: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl PageOutput {
    pub fn markdown(markdown: impl Into<String>) -> Self {
        PageOutput::Page {
            markdown: markdown.into(),
            extra: Map::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PageOutput::Text(text) => Value::String(text.clone()),
            PageOutput::Page { markdown, extra } => {
                let mut map = extra.clone();
                map.insert("markdown".to_string(), Value::String(markdown.clone()));
                Value::Object(map)
            }
        }
    }
}

impl From<String> for PageOutput {
    fn from(text: String) -> Self {
        PageOutput::Text(text)
    }
}

impl From<&str> for PageOutput {
    fn from(text: &str) -> Self {
        PageOutput::Text(text.to_string())
    }
}

/// Host side effect that publishes pipe output, e.g. to the board item's page.
#[async_trait]
pub trait PageWriter: Send + Sync {
    async fn write_page(&self, output: &PageOutput) -> anyhow::Result<()>;
}
