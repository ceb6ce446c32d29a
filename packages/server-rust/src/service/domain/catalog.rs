//! Catalog repository: the persistence seam behind the item handlers.
//!
//! Handlers only see [`CatalogRepository`]. Every call they make is wrapped
//! in [`Deadline::run`](crate::service::Deadline::run), so an implementation
//! backed by real I/O is abandoned as soon as the request times out.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::error::{json_message, DeadlineExceeded};

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Subject that created the item.
    pub owner: String,
}

/// Payload for creating an item.
#[derive(Debug, Clone, Deserialize)]
pub struct NewItem {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("item {id} not found")]
    NotFound { id: String },
    #[error("an item named {name:?} already exists")]
    Conflict { name: String },
    #[error("catalog call abandoned: request deadline exceeded")]
    Cancelled,
}

impl From<DeadlineExceeded> for CatalogError {
    fn from(_: DeadlineExceeded) -> Self {
        Self::Cancelled
    }
}

impl IntoResponse for CatalogError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        };
        json_message(status, &self.to_string())
    }
}

/// Storage interface for catalog items.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// All items, ordered by name.
    async fn list(&self) -> Result<Vec<Item>, CatalogError>;

    async fn get(&self, id: &str) -> Result<Item, CatalogError>;

    /// Creates an item owned by `owner`. Names are unique.
    async fn create(&self, owner: &str, item: NewItem) -> Result<Item, CatalogError>;

    async fn delete(&self, id: &str) -> Result<(), CatalogError>;
}

// ---------------------------------------------------------------------------
// InMemoryCatalog
// ---------------------------------------------------------------------------

/// `DashMap`-backed repository with optional simulated I/O latency.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    items: DashMap<String, Item>,
    /// name -> id, enforces name uniqueness.
    names: DashMap<String, String>,
    latency: Duration,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency` before touching the maps.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    async fn io(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl CatalogRepository for InMemoryCatalog {
    async fn list(&self) -> Result<Vec<Item>, CatalogError> {
        self.io().await;
        let mut items: Vec<Item> = self.items.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn get(&self, id: &str) -> Result<Item, CatalogError> {
        self.io().await;
        self.items
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CatalogError::NotFound { id: id.to_owned() })
    }

    async fn create(&self, owner: &str, item: NewItem) -> Result<Item, CatalogError> {
        self.io().await;
        match self.names.entry(item.name.clone()) {
            Entry::Occupied(_) => Err(CatalogError::Conflict { name: item.name }),
            Entry::Vacant(slot) => {
                let created = Item {
                    id: Uuid::new_v4().to_string(),
                    name: item.name,
                    description: item.description,
                    owner: owner.to_owned(),
                };
                slot.insert(created.id.clone());
                self.items.insert(created.id.clone(), created.clone());
                Ok(created)
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<(), CatalogError> {
        self.io().await;
        let (_, removed) = self
            .items
            .remove(id)
            .ok_or_else(|| CatalogError::NotFound { id: id.to_owned() })?;
        self.names.remove(&removed.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use gatehouse_core::RequestContext;

    use super::*;
    use crate::service::deadline::Deadline;

    fn new_item(name: &str) -> NewItem {
        NewItem {
            name: name.to_string(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn create_get_list_delete() {
        let catalog = InMemoryCatalog::new();
        let beta = catalog.create("alice", new_item("beta")).await.unwrap();
        catalog.create("bob", new_item("alpha")).await.unwrap();

        assert_eq!(beta.owner, "alice");
        assert_eq!(catalog.get(&beta.id).await.unwrap(), beta);

        let names: Vec<_> = catalog
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, ["alpha", "beta"]);

        catalog.delete(&beta.id).await.unwrap();
        assert!(matches!(
            catalog.get(&beta.id).await,
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_names_conflict_until_deleted() {
        let catalog = InMemoryCatalog::new();
        let first = catalog.create("alice", new_item("widget")).await.unwrap();
        assert!(matches!(
            catalog.create("bob", new_item("widget")).await,
            Err(CatalogError::Conflict { .. })
        ));

        catalog.delete(&first.id).await.unwrap();
        assert!(catalog.create("bob", new_item("widget")).await.is_ok());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let catalog = InMemoryCatalog::new();
        assert!(matches!(
            catalog.delete("nope").await,
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_abandons_slow_call_before_it_writes() {
        let catalog = InMemoryCatalog::with_latency(Duration::from_secs(5));
        let deadline = Deadline::new(&RequestContext::new(), Duration::from_millis(100));

        let result = deadline.run(catalog.create("alice", new_item("late"))).await;
        let err: CatalogError = result.unwrap_err().into();
        assert!(matches!(err, CatalogError::Cancelled));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(catalog.items.is_empty());
        assert!(catalog.names.is_empty());
    }

    #[test]
    fn error_statuses() {
        let not_found = CatalogError::NotFound { id: "x".into() }.into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        let conflict = CatalogError::Conflict { name: "x".into() }.into_response();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(CatalogError::Cancelled.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
