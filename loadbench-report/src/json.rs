//! JSON Output

use crate::report::SessionDocument;

/// Generate a prettified JSON document.
pub fn generate_json_report(document: &SessionDocument) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(document)
}

/// Parse a document written by [`generate_json_report`].
pub fn load_json_report(json: &str) -> Result<SessionDocument, serde_json::Error> {
    serde_json::from_str(json)
}
