//! Per-model customization points of a repository.
//!
//! Every method has a pass-through default, so models only implement the
//! hooks they need.

use crate::errors::{FieldError, RepoResult};
use crate::orm::filter::Filter;
use crate::orm::record::{Data, Record};
use crate::repo::Repository;
use serde_json::Value;

pub trait RepositoryHooks: Send + Sync {
    /// Replaces the default category check of `field`.
    ///
    /// Returning `None` keeps the default check.
    fn validate_field(
        &self,
        _repo: &Repository<'_>,
        _field: &str,
        _value: &Value,
        _data: &Data,
    ) -> Option<Result<(), FieldError>> {
        None
    }

    /// Computes creation defaults; `defaults` are the caller-supplied ones.
    fn create_defaults(&self, _data: &Data, defaults: Data) -> Data {
        defaults
    }

    /// Rewrites the stored row before insert. `extra` holds extra-allowed and
    /// calculated inputs, which are never stored as-is.
    fn before_insert(&self, _row: &mut Data, _extra: &Data) -> RepoResult<()> {
        Ok(())
    }

    fn before_update(&self, _instance: &Record, _row: &mut Data, _extra: &Data) -> RepoResult<()> {
        Ok(())
    }

    /// Refuses an edit of `instance` with `RepoError::Rejected`.
    fn can_edit(&self, _instance: &Record) -> RepoResult<()> {
        Ok(())
    }

    fn can_delete(&self, _instance: &Record) -> RepoResult<()> {
        Ok(())
    }

    /// Filters applied before caller filters on every read.
    fn default_filters(&self) -> Vec<Filter> {
        Vec::new()
    }
}

/// Hooks of a model that customizes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl RepositoryHooks for NoHooks {}
