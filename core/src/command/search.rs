// Search commands — publish files, search the group, browse one member

use super::{check_request, mismatch, response_for, CommandError};
use crate::config::Limits;
use crate::entity::{ClientComponent, Entity, ShareComponent};
use crate::message::{Body, BrowseBody, Data, FileEntry, SearchBody, SearchResult, ShareBody};
use std::sync::Arc;
use uuid::Uuid;

/// Publish the entity's file list to the router.
pub struct Share {
    entity: Arc<Entity>,
    limits: Limits,
}

impl Share {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    pub fn request(&self, files: Vec<FileEntry>) -> Result<Data, CommandError> {
        let data = Data::request(Body::Share(ShareBody { files, accepted: 0 }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    /// Returns how many entries the router accepted.
    pub fn validate(&self, request: &Data, response: &Data) -> Result<u32, CommandError> {
        let (Body::Share(sent), Body::Share(received)) =
            (&request.body, response_for(request, response)?)
        else {
            return Err(CommandError::Protocol("share response expected".into()));
        };

        if received.accepted as usize > sent.files.len() {
            return Err(CommandError::Protocol(format!(
                "router accepted {} of {} files",
                received.accepted,
                sent.files.len()
            )));
        }

        self.entity
            .add(ShareComponent::default())
            .replace(sent.files.clone());
        Ok(received.accepted)
    }
}

pub struct Search {
    entity: Arc<Entity>,
    limits: Limits,
}

impl Search {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    /// Build a search request with a fresh search id.
    pub fn request(&self, keyword: &str) -> Result<Data, CommandError> {
        let data = Data::request(Body::Search(SearchBody {
            search_id: Uuid::new_v4().simple().to_string(),
            keyword: keyword.to_string(),
            results: Vec::new(),
        }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    pub fn validate(
        &self,
        request: &Data,
        response: &Data,
    ) -> Result<Vec<SearchResult>, CommandError> {
        let (Body::Search(sent), Body::Search(received)) =
            (&request.body, response_for(request, response)?)
        else {
            return Err(CommandError::Protocol("search response expected".into()));
        };

        if sent.search_id != received.search_id {
            return Err(mismatch("search_id", &sent.search_id, &received.search_id));
        }

        // Never list our own files
        let own_id = self.entity.get::<ClientComponent>().map(|c| c.client_id.clone());
        Ok(received
            .results
            .iter()
            .filter(|result| own_id.as_deref() != Some(result.client_id.as_str()))
            .cloned()
            .collect())
    }
}

pub struct Browse {
    entity: Arc<Entity>,
    limits: Limits,
}

impl Browse {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self::with_limits(entity, Limits::default())
    }

    pub fn with_limits(entity: Arc<Entity>, limits: Limits) -> Self {
        Self { entity, limits }
    }

    /// List files `client_id` shares under `path` (empty = everything).
    pub fn request(&self, client_id: &str, path: &str) -> Result<Data, CommandError> {
        if let Some(client) = self.entity.get::<ClientComponent>() {
            if client.client_id == client_id {
                return Err(CommandError::Validation("cannot browse own files".into()));
            }
        }

        let data = Data::request(Body::Browse(BrowseBody {
            client_id: client_id.to_string(),
            path: path.to_string(),
            entries: Vec::new(),
        }));
        check_request(&data, &self.limits)?;
        Ok(data)
    }

    pub fn validate(&self, request: &Data, response: &Data) -> Result<Vec<FileEntry>, CommandError> {
        let (Body::Browse(sent), Body::Browse(received)) =
            (&request.body, response_for(request, response)?)
        else {
            return Err(CommandError::Protocol("browse response expected".into()));
        };

        if sent.client_id != received.client_id {
            return Err(mismatch("client_id", &sent.client_id, &received.client_id));
        }
        if sent.path != received.path {
            return Err(mismatch("path", &sent.path, &received.path));
        }
        Ok(received.entries.clone())
    }
}
