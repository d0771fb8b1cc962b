//! Collaborator interfaces
//!
//! The index does not own the changeset DAG, the content-addressed blob store
//! or the template layer. It reads all three through the traits below and
//! never writes back to them.

mod errors;
mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub use errors::{CollaboratorError, CollaboratorResult};
pub use types::{Audit, ChangesetData, ChangesetId, DagKind, Delta, Hidrec, ParentDelta, StoredRecord};

use crate::schema::FieldSpec;

/// Read access to the changeset DAG
pub trait ChangesetSource {
    /// Identifier of the DAG this source serves
    fn dag_id(&self) -> &str;

    /// Record-identity capabilities of the DAG type
    fn kind(&self) -> DagKind;

    /// Generation of a changeset (root = 0)
    fn generation(&self, csid: &str) -> CollaboratorResult<u64>;

    /// Direct parents of a changeset
    fn parents(&self, csid: &str) -> CollaboratorResult<Vec<ChangesetId>>;

    /// Records added and removed going from `base` to `target`
    fn delta(&self, base: &str, target: &str) -> CollaboratorResult<Delta>;

    /// Every record live in `csid`, i.e. the add-set relative to the empty root
    fn delta_from_root(&self, csid: &str) -> CollaboratorResult<BTreeSet<Hidrec>>;

    /// Template and per-parent deltas of a changeset
    fn load(&self, csid: &str) -> CollaboratorResult<ChangesetData>;
}

/// Content-addressed record storage
pub trait BlobStore {
    fn fetch(&self, hidrec: &str) -> CollaboratorResult<StoredRecord>;
}

/// Record-type definitions of templates
pub trait TemplateSource {
    fn list_rectypes(&self, template_id: &str) -> CollaboratorResult<Vec<String>>;

    fn fields_for_rectype(
        &self,
        template_id: &str,
        rectype: &str,
    ) -> CollaboratorResult<BTreeMap<String, FieldSpec>>;
}

impl<T: ChangesetSource + ?Sized> ChangesetSource for Arc<T> {
    fn dag_id(&self) -> &str {
        (**self).dag_id()
    }

    fn kind(&self) -> DagKind {
        (**self).kind()
    }

    fn generation(&self, csid: &str) -> CollaboratorResult<u64> {
        (**self).generation(csid)
    }

    fn parents(&self, csid: &str) -> CollaboratorResult<Vec<ChangesetId>> {
        (**self).parents(csid)
    }

    fn delta(&self, base: &str, target: &str) -> CollaboratorResult<Delta> {
        (**self).delta(base, target)
    }

    fn delta_from_root(&self, csid: &str) -> CollaboratorResult<BTreeSet<Hidrec>> {
        (**self).delta_from_root(csid)
    }

    fn load(&self, csid: &str) -> CollaboratorResult<ChangesetData> {
        (**self).load(csid)
    }
}

impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    fn fetch(&self, hidrec: &str) -> CollaboratorResult<StoredRecord> {
        (**self).fetch(hidrec)
    }
}

impl<T: TemplateSource + ?Sized> TemplateSource for Arc<T> {
    fn list_rectypes(&self, template_id: &str) -> CollaboratorResult<Vec<String>> {
        (**self).list_rectypes(template_id)
    }

    fn fields_for_rectype(
        &self,
        template_id: &str,
        rectype: &str,
    ) -> CollaboratorResult<BTreeMap<String, FieldSpec>> {
        (**self).fields_for_rectype(template_id, rectype)
    }
}
