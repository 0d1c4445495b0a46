// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Artifacts captured during step execution.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payloads above this size are stored by reference instead of inline.
pub const INLINE_LIMIT_BYTES: usize = 1024 * 1024;

/// One captured artifact (request/response body, screenshot, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    /// Display name, e.g. `response_body` or `screenshot.png`.
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Inline payload for small artifacts, base64-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    /// Opaque reference into the artifact store for large payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
}

impl Artifact {
    /// Builds an inline artifact; callers switch to a content reference
    /// when the payload crosses [`INLINE_LIMIT_BYTES`].
    pub fn inline(name: impl Into<String>, content_type: impl Into<String>, data: &[u8]) -> Self {
        use base64::Engine as _;
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            content_type: content_type.into(),
            size_bytes: data.len() as u64,
            inline: Some(base64::engine::general_purpose::STANDARD.encode(data)),
            content_ref: None,
        }
    }

    /// Builds a by-reference artifact.
    pub fn by_ref(
        name: impl Into<String>,
        content_type: impl Into<String>,
        size_bytes: u64,
        content_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            content_type: content_type.into(),
            size_bytes,
            inline: None,
            content_ref: Some(content_ref.into()),
        }
    }
}
