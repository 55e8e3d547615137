use serde::{Deserialize, Serialize};

pub const UPLOAD_SUCCESS_MESSAGE: &str = "File processed successfully";

/// Body returned when the separation tool exits successfully.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadResponse {
    pub message: String,
    /// The tool's standard output, verbatim
    pub output: String,
}

impl UploadResponse {
    pub fn processed(output: String) -> Self {
        Self {
            message: UPLOAD_SUCCESS_MESSAGE.to_string(),
            output,
        }
    }
}
