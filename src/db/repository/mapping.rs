use uuid::Uuid;

use crate::db::models::{Mapping, MappingInput, MappingRejection};
use crate::db::MappingStore;
use crate::error::AppResult;

pub struct MappingRepository;

impl MappingRepository {
    pub async fn list(store: &MappingStore) -> Vec<Mapping> {
        store.read().await.mappings
    }

    pub async fn find_by_id(store: &MappingStore, id: &str) -> Option<Mapping> {
        store.read().await.mappings.into_iter().find(|m| m.id == id)
    }

    /// Validate and append a new mapping.
    pub async fn create(store: &MappingStore, input: MappingInput) -> AppResult<Mapping> {
        let mapping = input.into_mapping(Uuid::new_v4().to_string())?;

        store
            .update(|doc| {
                ensure_unique(&doc.mappings, &mapping)?;
                doc.mappings.push(mapping.clone());
                Ok(mapping)
            })
            .await
    }

    /// Replace the mapping with `id`, keeping its position in the list.
    pub async fn update(store: &MappingStore, id: &str, input: MappingInput) -> AppResult<Mapping> {
        let mapping = input.into_mapping(id.to_string())?;

        store
            .update(|doc| {
                let position = doc
                    .mappings
                    .iter()
                    .position(|m| m.id == id)
                    .ok_or_else(|| MappingRejection::NotFound(id.to_string()))?;
                ensure_unique(&doc.mappings, &mapping)?;
                doc.mappings[position] = mapping.clone();
                Ok(mapping)
            })
            .await
    }

    pub async fn delete(store: &MappingStore, id: &str) -> AppResult<()> {
        store
            .update(|doc| {
                let before = doc.mappings.len();
                doc.mappings.retain(|m| m.id != id);
                if doc.mappings.len() == before {
                    return Err(MappingRejection::NotFound(id.to_string()).into());
                }
                Ok(())
            })
            .await
    }
}

/// Reject `candidate` if another mapping already occupies its exclusive class
/// or triggers on the same command, reward or threshold.
fn ensure_unique(existing: &[Mapping], candidate: &Mapping) -> Result<(), MappingRejection> {
    let others = || existing.iter().filter(|m| m.id != candidate.id);

    if let Some(class) = candidate.mapping_type.exclusive_class() {
        if others().any(|m| m.mapping_type.exclusive_class() == Some(class)) {
            return Err(MappingRejection::DuplicateExclusiveType(class));
        }
    }

    if let Some(key) = candidate.trigger_key() {
        let clash = others().any(|m| {
            m.mapping_type == candidate.mapping_type && m.trigger_key().as_ref() == Some(&key)
        });
        if clash {
            return Err(MappingRejection::DuplicateTrigger(key));
        }
    }

    Ok(())
}
