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

use async_trait::async_trait;
use bson::{doc, Bson};
use ladle_core::event::{ChangeEvent, Namespace, OperationType, ResumeToken};
use ladle_core::handler::{ChangeHandler, HandlerError, HandlerOutcome, HandlerRegistry};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Collects the ids of inserted documents; rejects everything else.
#[derive(Default)]
struct InsertedIds {
    ids: Mutex<Vec<Bson>>,
}

#[async_trait]
impl ChangeHandler for InsertedIds {
    fn name(&self) -> &str {
        "inserted-ids"
    }

    fn accepts(&self, event: &ChangeEvent) -> bool {
        event.is_insert()
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        let id = event
            .document_id()
            .cloned()
            .ok_or_else(|| HandlerError::other_msg("insert without document key"))?;
        self.ids.lock().await.push(id);
        Ok(())
    }
}

fn change(op: OperationType, id: i32, data: &str) -> ChangeEvent {
    ChangeEvent::new(
        op,
        Namespace::new("kitchen", "recipes"),
        ResumeToken::from_document(doc! { "_data": data }),
    )
    .with_document_key(doc! { "_id": id })
}

#[tokio::test]
async fn test_custom_handler_receives_accepted_changes() {
    let handler = Arc::new(InsertedIds::default());
    let mut registry = HandlerRegistry::new();
    registry.register_shared(handler.clone());

    let outcomes = registry
        .dispatch_all(&change(OperationType::Insert, 7, "01"))
        .await;
    assert!(matches!(outcomes[..], [HandlerOutcome::Delivered]));

    let outcomes = registry
        .dispatch_all(&change(OperationType::Delete, 7, "02"))
        .await;
    assert!(matches!(outcomes[..], [HandlerOutcome::Skipped]));

    assert_eq!(*handler.ids.lock().await, vec![Bson::Int32(7)]);
}

#[tokio::test]
async fn test_handler_error_is_reported_in_outcome() {
    let mut registry = HandlerRegistry::new();
    registry.register(InsertedIds::default());

    let keyless = ChangeEvent::new(
        OperationType::Insert,
        Namespace::new("kitchen", "recipes"),
        ResumeToken::from_document(doc! { "_data": "03" }),
    );
    let outcomes = registry.dispatch_all(&keyless).await;

    match &outcomes[0] {
        HandlerOutcome::Failed(e) => {
            assert_eq!(e.to_string(), "Handler error: insert without document key");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_registry_dispatches_nothing() {
    let registry = HandlerRegistry::new();
    assert!(registry.is_empty());

    let outcomes = registry
        .dispatch_all(&change(OperationType::Insert, 1, "04"))
        .await;
    assert!(outcomes.is_empty());
}

#[test]
fn test_registry_debug_lists_names() {
    let mut registry = HandlerRegistry::new();
    registry.register(InsertedIds::default());

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.names(), vec!["inserted-ids"]);
    assert!(format!("{registry:?}").contains("inserted-ids"));
}

#[test]
fn test_configuration_error_carries_parameter() {
    let error = HandlerError::configuration("stream name is empty", Some("stream".to_string()));

    match &error {
        HandlerError::Configuration { parameter, .. } => {
            assert_eq!(parameter.as_deref(), Some("stream"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(error.to_string(), "Configuration error: stream name is empty");
    assert!(!error.is_retryable());
}
