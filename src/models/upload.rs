//! Shapes that travel with chunk requests and describe an upload in flight.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One chunk as received from a client.
#[derive(Clone, Debug)]
pub struct ChunkUpload {
    /// Client-supplied identifier shared by every chunk of one file.
    pub upload_id: String,

    /// 0-based position of this chunk.
    pub chunk_index: u32,

    /// Declared number of chunks for the whole file.
    pub total_chunks: u32,

    /// Raw chunk payload, copied verbatim.
    pub bytes: Bytes,
}

/// Free-text fields supplied alongside an upload (`orderData` on the wire).
///
/// Typically repeated on every chunk; only the copy carried by the chunk that
/// triggers the merge is recorded. Clients send camelCase or PascalCase keys.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadDetails {
    #[serde(alias = "Description")]
    pub description: Option<String>,
    #[serde(alias = "ProductName")]
    pub product_name: Option<String>,
    #[serde(alias = "PatientName")]
    pub patient_name: Option<String>,
}

/// Identity of the authenticated caller, resolved upstream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Uploader {
    pub id: String,
    pub name: Option<String>,
    pub account: Option<String>,
    pub organization_id: Option<String>,
}

/// Everything the merge step needs besides the chunks themselves.
#[derive(Clone, Debug)]
pub struct MergeContext {
    /// File name declared by the client; its extension is kept on the output.
    pub file_name: String,
    pub details: UploadDetails,
    pub uploader: Uploader,
}

impl MergeContext {
    /// Extension of the declared file name including the leading dot, or an
    /// empty string when there is none.
    ///
    /// Kept as sent, except that control characters and backslashes (which
    /// `Path` does not treat as separators on Unix) drop it entirely.
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && !ext.chars().any(|c| c.is_control() || c == '\\'))
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default()
    }
}

/// Merge lifecycle of an upload session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeState {
    Open,
    Merging,
    Completed,
    Failed,
}
