use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Key under which an element's text travels in an [`InferItem`].
pub const TEXT_KEY: &str = "text";

/// One inference input: the element text plus any auxiliary fields.
pub type InferItem = BTreeMap<String, String>;

/// Classifier-specific training parameters.
pub type TrainParams = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub label: bool,
    pub score: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainElement {
    pub item: InferItem,
    pub label: bool,
    /// Padded in by the train-set selector rather than given by a person.
    #[serde(default)]
    pub weak: bool,
}

/// Tag naming a classifier implementation, e.g. `svm_over_bow`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ModelType(String);

impl ModelType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

pub fn text_item(text: &str) -> InferItem {
    let mut item = InferItem::new();
    item.insert(TEXT_KEY.to_string(), text.to_string());
    item
}
