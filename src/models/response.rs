use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Where one size was written and its true dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSize {
    pub path: String,
    pub width: u32,
    pub height: u32,
}

/// Size name to result, ordered by name.
pub type SizeResults = BTreeMap<String, ResultSize>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeResponse {
    pub sizes: SizeResults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
