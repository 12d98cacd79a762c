// Copyright 2025 Ladle Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Stream entry layout.

use bson::Bson;
use ladle_core::event::ChangeEvent;
use ladle_core::handler::HandlerError;
use serde::Serialize;

/// JSON body of a stream entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload<'a> {
    /// Operation name (`insert`, `update`, ...)
    pub operation: &'a str,
    /// Source database
    pub database: &'a str,
    /// Source collection
    pub collection: &'a str,
    /// `_id` of the changed document, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<&'a Bson>,
    /// Document after the change, if the feed carried it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_document: Option<&'a bson::Document>,
    /// Changed and removed fields of an update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_description: Option<&'a ladle_core::event::UpdateDescription>,
    /// Cluster time of the change, RFC 3339
    pub cluster_time: String,
}

/// One entry appended to the stream.
///
/// Field order matches the entry written by `XADD`:
/// `dedup_id`, `group_key`, `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Stable identity of the change, derived from its resume token.
    ///
    /// A replayed change carries the same id, which is what the
    /// de-duplication key is built from.
    pub dedup_id: String,

    /// Key consumers can partition or order by.
    pub group_key: String,

    /// JSON-encoded [`Payload`].
    pub payload: String,
}

impl OutboundMessage {
    /// Builds the entry for `event`.
    ///
    /// The group key is taken from `group_key_field` of the full document
    /// when present, then from the document id, then from the collection name.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Serialization`] if the payload cannot be encoded.
    pub fn from_event(
        event: &ChangeEvent,
        group_key_field: Option<&str>,
    ) -> Result<Self, HandlerError> {
        let payload = Payload {
            operation: event.operation.as_str(),
            database: event.database_name(),
            collection: event.collection_name(),
            document_id: event.document_id(),
            full_document: event.full_document.as_ref(),
            update_description: event.update_description.as_ref(),
            cluster_time: event.cluster_time.to_rfc3339(),
        };
        let payload = serde_json::to_string(&payload)
            .map_err(|e| HandlerError::serialization(e, "Failed to encode stream payload"))?;

        Ok(Self {
            dedup_id: event.resume_token.fingerprint(),
            group_key: group_key(event, group_key_field),
            payload,
        })
    }
}

fn group_key(event: &ChangeEvent, field: Option<&str>) -> String {
    field
        .and_then(|f| event.full_document.as_ref()?.get(f))
        .or_else(|| event.document_id())
        .map_or_else(|| event.collection_name().to_string(), key_string)
}

fn key_string(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(id) => id.to_hex(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}
