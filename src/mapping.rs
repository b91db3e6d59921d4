//! Structural mapping of entity types to tables.
//!
//! Every entity describes itself once through [`Entity::describe`]. The
//! description is validated into a [`StructuralMap`] and published in a
//! process-wide [`MapRegistry`]; all later compiles share the same `Arc`.

use crate::backend::QueryRow;
use crate::error::{QueryError, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Reads one field off an entity instance. `None` means SQL NULL.
pub type Accessor<E> = fn(&E) -> Option<Value>;

/// Static field kind, decided when the map is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    /// Navigation to a set of related entities; never a column.
    RelatedSet,
}

/// Column metadata for a mapped field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub is_db_generated: bool,
    pub is_db_field: bool,
    pub kind: FieldKind,
}

/// A mapped field: member identifier, column metadata and value accessor
pub struct FieldMap<E> {
    pub member: String,
    pub column: ColumnInfo,
    accessor: Option<Accessor<E>>,
}

impl<E> FieldMap<E> {
    /// Current value of this field on `entity`.
    pub fn value(&self, entity: &E) -> Option<Value> {
        match self.accessor {
            Some(read) => read(entity).filter(|v| !v.is_null()),
            None => None,
        }
    }
}

impl<E> std::fmt::Debug for FieldMap<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldMap")
            .field("member", &self.member)
            .field("column", &self.column)
            .finish()
    }
}

/// Implemented by every mapped entity type.
pub trait Entity: Sized + Send + Sync + 'static {
    fn describe() -> EntityDescriptor<Self>;
}

struct FieldDef<E> {
    member: String,
    column: Option<String>,
    generated: bool,
    key: bool,
    db_field: bool,
    kind: FieldKind,
    accessor: Option<Accessor<E>>,
}

/// Raw description of an entity, as declared by its `Entity` impl.
pub struct EntityDescriptor<E> {
    table: String,
    fields: Vec<FieldDef<E>>,
}

impl<E: Entity> EntityDescriptor<E> {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
        }
    }

    fn push(mut self, def: FieldDef<E>) -> Self {
        self.fields.push(def);
        self
    }

    /// Server-generated primary key.
    pub fn key(self, member: impl Into<String>, accessor: Accessor<E>) -> Self {
        self.push(FieldDef {
            member: member.into(),
            column: None,
            generated: true,
            key: true,
            db_field: true,
            kind: FieldKind::Scalar,
            accessor: Some(accessor),
        })
    }

    /// Primary key assigned by the application.
    pub fn natural_key(self, member: impl Into<String>, accessor: Accessor<E>) -> Self {
        self.push(FieldDef {
            member: member.into(),
            column: None,
            generated: false,
            key: true,
            db_field: true,
            kind: FieldKind::Scalar,
            accessor: Some(accessor),
        })
    }

    /// Plain field stored in a column of the same name.
    pub fn field(self, member: impl Into<String>, accessor: Accessor<E>) -> Self {
        self.push(FieldDef {
            member: member.into(),
            column: None,
            generated: false,
            key: false,
            db_field: true,
            kind: FieldKind::Scalar,
            accessor: Some(accessor),
        })
    }

    /// Field stored under a different column name (or a computed column expression).
    pub fn column(
        self,
        member: impl Into<String>,
        column: impl Into<String>,
        accessor: Accessor<E>,
    ) -> Self {
        self.push(FieldDef {
            member: member.into(),
            column: Some(column.into()),
            generated: false,
            key: false,
            db_field: true,
            kind: FieldKind::Scalar,
            accessor: Some(accessor),
        })
    }

    /// Member that is not persisted at all.
    pub fn transient(self, member: impl Into<String>) -> Self {
        self.push(FieldDef {
            member: member.into(),
            column: None,
            generated: false,
            key: false,
            db_field: false,
            kind: FieldKind::Scalar,
            accessor: None,
        })
    }

    /// Navigation to related entities.
    pub fn related_set(self, member: impl Into<String>) -> Self {
        self.push(FieldDef {
            member: member.into(),
            column: None,
            generated: false,
            key: false,
            db_field: false,
            kind: FieldKind::RelatedSet,
            accessor: None,
        })
    }
}

/// Validated, immutable mapping of one entity type
pub struct StructuralMap<E> {
    entity: &'static str,
    table: String,
    fields: Vec<FieldMap<E>>,
    by_member: HashMap<String, usize>,
    index: Option<usize>,
}

impl<E: Entity> StructuralMap<E> {
    pub fn build(descriptor: EntityDescriptor<E>) -> Result<Self> {
        let entity = std::any::type_name::<E>();

        if descriptor.table.trim().is_empty() {
            return Err(QueryError::Mapping(format!(
                "{} declares no table identity",
                entity
            )));
        }

        if descriptor.fields.is_empty() {
            return Err(QueryError::Mapping(format!("{} declares no fields", entity)));
        }

        let mut fields = Vec::with_capacity(descriptor.fields.len());
        let mut by_member = HashMap::new();
        let mut explicit_key = None;
        let mut first_generated = None;

        for (position, def) in descriptor.fields.into_iter().enumerate() {
            if by_member.insert(def.member.clone(), position).is_some() {
                return Err(QueryError::Mapping(format!(
                    "{} declares field {} twice",
                    entity, def.member
                )));
            }

            if def.key && explicit_key.is_none() {
                explicit_key = Some(position);
            }
            if def.generated && first_generated.is_none() {
                first_generated = Some(position);
            }

            let name = def.column.unwrap_or_else(|| def.member.clone());
            fields.push(FieldMap {
                member: def.member,
                column: ColumnInfo {
                    name,
                    is_db_generated: def.generated,
                    is_db_field: def.db_field,
                    kind: def.kind,
                },
                accessor: def.accessor,
            });
        }

        Ok(Self {
            entity,
            table: descriptor.table,
            fields,
            by_member,
            index: explicit_key.or(first_generated),
        })
    }
}

impl<E> StructuralMap<E> {
    /// Rust type name of the mapped entity.
    pub fn entity_name(&self) -> &'static str {
        self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn field(&self, member: &str) -> Option<&FieldMap<E>> {
        self.by_member.get(member).map(|&i| &self.fields[i])
    }

    /// All fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldMap<E>> {
        self.fields.iter()
    }

    /// Fields persisted as scalar columns, in declaration order.
    pub fn db_fields(&self) -> impl Iterator<Item = &FieldMap<E>> {
        self.fields
            .iter()
            .filter(|f| f.column.is_db_field && f.column.kind == FieldKind::Scalar)
    }

    /// The primary-key field used as default ordering and update target.
    pub fn index_field(&self) -> Option<&FieldMap<E>> {
        self.index.map(|i| &self.fields[i])
    }

    /// Look a member up in a result row, by its select alias first, then by column name.
    pub fn row_value<'r>(&self, row: &'r QueryRow, member: &str) -> Option<&'r Value> {
        row.get_value(member).or_else(|| {
            self.field(member)
                .and_then(|f| row.get_value(&f.column.name))
        })
    }
}

/// Process-wide registry of structural maps, keyed by entity type.
#[derive(Default)]
pub struct MapRegistry {
    maps: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl MapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared registry used by [`get_map`].
    pub fn global() -> &'static MapRegistry {
        static REGISTRY: OnceLock<MapRegistry> = OnceLock::new();
        REGISTRY.get_or_init(MapRegistry::new)
    }

    /// Get the map for `E`, building and publishing it on first access.
    ///
    /// The build runs outside the lock. When two callers race, the first
    /// published map wins and the other build is discarded, so every caller
    /// observes the same fully built instance.
    pub fn get<E: Entity>(&self) -> Result<Arc<StructuralMap<E>>> {
        let type_id = TypeId::of::<E>();

        if let Some(existing) = self.maps.read().get(&type_id).cloned() {
            return downcast::<E>(existing);
        }

        let built: Arc<dyn Any + Send + Sync> = Arc::new(StructuralMap::build(E::describe())?);

        let published = {
            let mut maps = self.maps.write();
            maps.entry(type_id).or_insert(built).clone()
        };

        tracing::trace!(entity = std::any::type_name::<E>(), "structural map published");
        downcast::<E>(published)
    }

    pub fn len(&self) -> usize {
        self.maps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.read().is_empty()
    }
}

fn downcast<E: Entity>(map: Arc<dyn Any + Send + Sync>) -> Result<Arc<StructuralMap<E>>> {
    map.downcast::<StructuralMap<E>>().map_err(|_| {
        QueryError::Mapping(format!(
            "registry entry for {} has the wrong type",
            std::any::type_name::<E>()
        ))
    })
}

/// Structural map for `E` from the global registry.
pub fn get_map<E: Entity>() -> Result<Arc<StructuralMap<E>>> {
    MapRegistry::global().get::<E>()
}
