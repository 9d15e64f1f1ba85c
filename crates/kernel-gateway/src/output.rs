//! Execution output fragments, reduced from Jupyter iopub content.

use jupyter_protocol::JupyterMessageContent;
use serde::{Deserialize, Serialize};

/// Image mime types preferred over text when a display bundle carries both.
const IMAGE_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/svg+xml", "image/gif"];

/// One output fragment produced by an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputData {
    /// Stream text or a plain-text rich result.
    Text { name: String, text: String },
    /// Base64 (or SVG text) image data from a rich result.
    Image { mime_type: String, data: String },
    /// Exception raised by the executed code.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl OutputData {
    pub fn is_error(&self) -> bool {
        matches!(self, OutputData::Error { .. })
    }
}

/// Reduce an iopub message to an output fragment.
///
/// Returns `None` for content that carries no displayable output (status,
/// execute_input, comm traffic, ...).
pub fn output_from_content(content: &JupyterMessageContent) -> Option<OutputData> {
    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            Some(OutputData::Text {
                name: name.to_string(),
                text: stream.text.clone(),
            })
        }
        JupyterMessageContent::DisplayData(display) => {
            media_to_output(serde_json::to_value(&display.data).ok()?)
        }
        JupyterMessageContent::ExecuteResult(result) => {
            media_to_output(serde_json::to_value(&result.data).ok()?)
        }
        JupyterMessageContent::ErrorOutput(error) => Some(OutputData::Error {
            ename: error.ename.clone(),
            evalue: error.evalue.clone(),
            traceback: error.traceback.clone(),
        }),
        _ => None,
    }
}

/// Pick the best representation out of a serialized mime bundle.
fn media_to_output(bundle: serde_json::Value) -> Option<OutputData> {
    let bundle = bundle.as_object()?;

    for mime in IMAGE_MIME_TYPES {
        if let Some(data) = bundle.get(*mime).and_then(value_as_text) {
            return Some(OutputData::Image {
                mime_type: mime.to_string(),
                data,
            });
        }
    }

    bundle
        .get("text/plain")
        .and_then(value_as_text)
        .map(|text| OutputData::Text {
            name: "result".to_string(),
            text,
        })
}

/// Mime bundle values are strings or arrays of lines.
fn value_as_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(lines) => Some(
            lines
                .iter()
                .filter_map(|l| l.as_str())
                .collect::<Vec<_>>()
                .join(""),
        ),
        _ => None,
    }
}
