//! Relationship registry.
//!
//! Static table of which collections reference each deletable entity kind,
//! and how. The accessor for every relationship is resolved once when the
//! registry is built; the analyzer, the executor and the orphan scanner all
//! read and mutate references through it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use common::store::{Document, FieldPath, Filter, Segment, Update};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CascadeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Student,
    Teacher,
    Orchestra,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Student, EntityKind::Teacher, EntityKind::Orchestra];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Student => "student",
            EntityKind::Teacher => "teacher",
            EntityKind::Orchestra => "orchestra",
        }
    }

    /// Collection holding entities of this kind.
    pub fn collection(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "student" | "students" => Ok(EntityKind::Student),
            "teacher" | "teachers" => Ok(EntityKind::Teacher),
            "orchestra" | "orchestras" => Ok(EntityKind::Orchestra),
            _ => Err(CascadeError::UnknownEntityKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Low,
    Medium,
    High,
    Critical,
}

/// What the executor does to documents holding a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CascadeAction {
    /// Pull the id out of the array or nested structure holding it.
    RemoveReference,
    /// Keep the document, flagging it archived.
    PreserveHistory,
    /// Keep the document, flagging it archived and inactive.
    ArchiveRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    Direct,
    ArrayOfIds,
    NestedArrayField,
}

/// How a referencing document stores the id.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldAccessor {
    /// A scalar field holding the id.
    Direct { field: FieldPath },
    /// An array of ids.
    ArrayOfIds { array: FieldPath },
    /// An array of objects (possibly under other arrays) whose `field` holds the id.
    NestedArrayField { container: FieldPath, field: String },
}

impl FieldAccessor {
    /// Resolve a dotted path. For nested fields the last segment is the
    /// field inside the container array.
    fn resolve(kind: FieldKind, path: &str) -> Self {
        match kind {
            FieldKind::Direct => FieldAccessor::Direct {
                field: FieldPath::parse(path),
            },
            FieldKind::ArrayOfIds => FieldAccessor::ArrayOfIds {
                array: FieldPath::parse(path),
            },
            FieldKind::NestedArrayField => {
                let (container, field) = path.rsplit_once('.').unwrap_or(("", path));
                FieldAccessor::NestedArrayField {
                    container: FieldPath::parse(container),
                    field: field.to_string(),
                }
            }
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldAccessor::Direct { .. } => FieldKind::Direct,
            FieldAccessor::ArrayOfIds { .. } => FieldKind::ArrayOfIds,
            FieldAccessor::NestedArrayField { .. } => FieldKind::NestedArrayField,
        }
    }

    /// Full path to the stored id.
    pub fn path(&self) -> FieldPath {
        match self {
            FieldAccessor::Direct { field } => field.clone(),
            FieldAccessor::ArrayOfIds { array } => array.clone(),
            FieldAccessor::NestedArrayField { container, field } => {
                container.clone().field(field.clone())
            }
        }
    }

    /// Filter selecting documents that reference `id`.
    pub fn matches_filter(&self, id: &str) -> Filter {
        Filter::eq(self.path(), id)
    }

    /// Filter selecting documents holding any reference at all.
    pub fn present_filter(&self) -> Filter {
        Filter::exists(self.path(), true)
    }

    /// Every id referenced by `doc` through this accessor.
    pub fn referenced_ids(&self, doc: &Document) -> Vec<String> {
        let path = self.path();
        let mut ids = Vec::new();
        for value in common::store::path::resolve(doc, &path) {
            match value {
                Value::String(id) => ids.push(id.clone()),
                Value::Array(items) => {
                    ids.extend(items.iter().filter_map(Value::as_str).map(str::to_string))
                }
                _ => {}
            }
        }
        ids
    }

    /// Updates removing the reference to `id`.
    pub fn detach(&self, id: &str) -> Vec<Update> {
        match self {
            FieldAccessor::Direct { field } => vec![Update::unset(field)],
            FieldAccessor::ArrayOfIds { array } => vec![Update::pull(array, id)],
            FieldAccessor::NestedArrayField { container, field } => {
                vec![Update::pull_where(container, field.clone(), id)]
            }
        }
    }

    /// Filter selecting the snapshot holder `doc_id` when a reattach may
    /// write to it. A direct field that was reassigned since the deletion
    /// is left alone.
    pub fn reattach_filter(&self, doc_id: &str) -> Filter {
        match self {
            FieldAccessor::Direct { field } => {
                Filter::and([Filter::id(doc_id), Filter::exists(field.clone(), false)])
            }
            _ => Filter::id(doc_id),
        }
    }

    /// Updates re-adding the reference to `id` as it appeared in
    /// `snapshot_doc`. Arrays use set semantics, so replaying is harmless.
    pub fn reattach(&self, snapshot_doc: &Document, id: &str) -> Vec<Update> {
        match self {
            FieldAccessor::Direct { field } => vec![Update::set(field, id)],
            FieldAccessor::ArrayOfIds { array } => vec![Update::add_to_set(array, id)],
            FieldAccessor::NestedArrayField { container, field } => {
                let mut updates = Vec::new();
                let root = Value::Object(snapshot_doc.clone());
                collect_reattach(
                    &root,
                    container.segments(),
                    FieldPath::default(),
                    field,
                    id,
                    &mut updates,
                );
                updates
            }
        }
    }
}

/// Walk `value` along `segments`, pinning every intermediate array element
/// by `_id`, and emit an add-to-set for each nested element holding `id`.
fn collect_reattach(
    value: &Value,
    segments: &[Segment],
    prefix: FieldPath,
    field: &str,
    id: &str,
    out: &mut Vec<Update>,
) {
    let Some((head, rest)) = segments.split_first() else {
        if let Value::Array(items) = value {
            for item in items {
                if item.get(field).and_then(Value::as_str) == Some(id) {
                    out.push(Update::add_to_set(prefix.clone(), item.clone()));
                }
            }
        }
        return;
    };

    match (head, value) {
        (Segment::Field(name), Value::Object(map)) => {
            if let Some(child) = map.get(name) {
                collect_reattach(child, rest, prefix.field(name.clone()), field, id, out);
            }
        }
        (_, Value::Array(items)) => {
            for item in items {
                let pinned = match item.get("_id") {
                    Some(item_id) => prefix.clone().where_eq("_id", item_id.clone()),
                    None => prefix.clone(),
                };
                collect_reattach(item, segments, pinned, field, id, out);
            }
        }
        _ => {}
    }
}

/// One collection's reference to a deletable entity.
#[derive(Debug, Clone)]
pub struct RelationshipDefinition {
    pub owner_collection: String,
    pub accessor: FieldAccessor,
    pub criticality: Criticality,
    pub action: CascadeAction,
    /// Counts toward the attendance-volume warning
    pub attendance_like: bool,
    pub impact_description: String,
}

impl RelationshipDefinition {
    fn new(
        owner_collection: &str,
        path: &str,
        kind: FieldKind,
        action: CascadeAction,
        criticality: Criticality,
        impact_description: &str,
    ) -> Self {
        Self {
            owner_collection: owner_collection.to_string(),
            accessor: FieldAccessor::resolve(kind, path),
            criticality,
            action,
            attendance_like: false,
            impact_description: impact_description.to_string(),
        }
    }

    fn attendance_like(mut self) -> Self {
        self.attendance_like = true;
        self
    }

    pub fn field_path(&self) -> String {
        self.accessor.path().to_string()
    }

    /// Top-level field of the reference, used to project samples.
    pub fn root_field(&self) -> String {
        self.accessor
            .path()
            .root()
            .unwrap_or_default()
            .to_string()
    }

    /// Documents that currently reference `id`. Records already archived or
    /// soft-deleted no longer count as live references.
    pub fn reference_filter(&self, id: &str) -> Filter {
        Filter::and([
            self.accessor.matches_filter(id),
            Filter::ne("archived", true),
            Filter::ne("deleted", true),
        ])
    }
}

/// Lookup of relationships per entity kind.
#[derive(Debug, Clone)]
pub struct Registry {
    relationships: HashMap<EntityKind, Vec<RelationshipDefinition>>,
}

impl Registry {
    pub fn new(relationships: HashMap<EntityKind, Vec<RelationshipDefinition>>) -> Self {
        Self { relationships }
    }

    /// The conservatory's relationship table.
    pub fn conservatory() -> Self {
        use CascadeAction::*;
        use Criticality::*;
        use FieldKind::*;

        let student = vec![
            RelationshipDefinition::new(
                "teacher",
                "teaching.timeBlocks.assignedLessons.studentId",
                NestedArrayField,
                RemoveReference,
                High,
                "Lessons assigned to the student in teacher time blocks",
            ),
            RelationshipDefinition::new(
                "orchestra",
                "memberIds",
                ArrayOfIds,
                RemoveReference,
                Medium,
                "Orchestra and ensemble memberships",
            ),
            RelationshipDefinition::new(
                "activity_attendance",
                "studentId",
                Direct,
                PreserveHistory,
                Medium,
                "Rehearsal and theory lesson attendance history",
            )
            .attendance_like(),
            RelationshipDefinition::new(
                "bagrut",
                "studentId",
                Direct,
                ArchiveRecord,
                Critical,
                "Bagrut (matriculation) academic records",
            ),
        ];

        let teacher = vec![
            RelationshipDefinition::new(
                "student",
                "teacherAssignments.teacherId",
                NestedArrayField,
                RemoveReference,
                High,
                "Student teacher assignments",
            ),
            RelationshipDefinition::new(
                "orchestra",
                "conductorId",
                Direct,
                RemoveReference,
                High,
                "Orchestras conducted by the teacher",
            ),
            RelationshipDefinition::new(
                "theory_lesson",
                "teacherId",
                Direct,
                PreserveHistory,
                Medium,
                "Theory lessons taught by the teacher",
            ),
        ];

        let orchestra = vec![
            RelationshipDefinition::new(
                "student",
                "enrollments.orchestraIds",
                ArrayOfIds,
                RemoveReference,
                Medium,
                "Student orchestra enrollments",
            ),
            RelationshipDefinition::new(
                "rehearsal",
                "groupId",
                Direct,
                PreserveHistory,
                Medium,
                "Rehearsals held by the orchestra",
            )
            .attendance_like(),
        ];

        Self::new(HashMap::from([
            (EntityKind::Student, student),
            (EntityKind::Teacher, teacher),
            (EntityKind::Orchestra, orchestra),
        ]))
    }

    pub fn relationships(&self, kind: EntityKind) -> &[RelationshipDefinition] {
        self.relationships
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Relationships for a kind given by name. Unknown kinds have none.
    pub fn list_relationships(&self, kind: &str) -> &[RelationshipDefinition] {
        kind.parse::<EntityKind>()
            .map(|kind| self.relationships(kind))
            .unwrap_or_default()
    }

    /// Find the relationship of `kind` stored at `collection`/`field_path`.
    pub fn find(
        &self,
        kind: EntityKind,
        collection: &str,
        field_path: &str,
    ) -> Option<&RelationshipDefinition> {
        self.relationships(kind)
            .iter()
            .find(|r| r.owner_collection == collection && r.field_path() == field_path)
    }

    /// Every `(target kind, relationship)` pair.
    pub fn all(&self) -> impl Iterator<Item = (EntityKind, &RelationshipDefinition)> {
        EntityKind::ALL
            .into_iter()
            .flat_map(move |kind| self.relationships(kind).iter().map(move |r| (kind, r)))
    }
}
