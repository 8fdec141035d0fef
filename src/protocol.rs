//! JSON-RPC message types and LSP parameter builders.

use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Initialize params declaring the client capability set fortls cares about:
/// save-aware sync, definition/references/hover/completion, hierarchical
/// document symbols, and workspace folder awareness.
pub(crate) fn initialize_params(project_root: &Path) -> Result<serde_json::Value, PathToUriError> {
    let root_uri = path_to_file_uri(project_root)?;
    let folder_name = project_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("workspace"));

    Ok(serde_json::json!({
        "processId": std::process::id(),
        "rootPath": project_root.to_string_lossy(),
        "rootUri": root_uri.as_str(),
        "capabilities": {
            "textDocument": {
                "synchronization": { "didSave": true, "dynamicRegistration": true },
                "definition": { "dynamicRegistration": true },
                "references": { "dynamicRegistration": true },
                "documentSymbol": {
                    "dynamicRegistration": true,
                    "hierarchicalDocumentSymbolSupport": true,
                    "symbolKind": { "valueSet": (1..=26).collect::<Vec<u32>>() }
                },
                "hover": {
                    "dynamicRegistration": true,
                    "contentFormat": ["markdown", "plaintext"]
                },
                "completion": { "dynamicRegistration": true }
            },
            "workspace": {
                "workspaceFolders": true,
                "didChangeConfiguration": { "dynamicRegistration": true },
                "symbol": { "dynamicRegistration": true }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri.as_str(),
            "name": folder_name
        }]
    }))
}

pub(crate) fn document_symbol_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn workspace_symbol_params(query: &str) -> serde_json::Value {
    serde_json::json!({ "query": query })
}

/// Params for position-based requests (hover, definition, references).
/// Line and column are zero-indexed per the LSP convention.
pub(crate) fn text_position_params(uri: &str, line: u32, character: u32) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

/// References additionally carry an include-declaration flag.
pub(crate) fn references_params(uri: &str, line: u32, character: u32) -> serde_json::Value {
    let mut params = text_position_params(uri, line, character);
    params["context"] = serde_json::json!({ "includeDeclaration": true });
    params
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri).ok().and_then(|u| u.to_file_path().ok())
}
