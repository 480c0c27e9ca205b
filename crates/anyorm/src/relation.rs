//! Relationship metadata.
//!
//! Every relation is described by which column of the parent record is matched
//! against which column of the related rows. The eager loader only ever compares
//! `parent[parent_key]` with `related[related_key]`, whatever the kind.
//!
//! | kind | parent_key | related_key |
//! |---|---|---|
//! | `HasOne` / `HasMany` | local key (`id`) | foreign key on related (`user_id`) |
//! | `BelongsTo` | foreign key on parent (`user_id`) | owner key (`id`) |
//! | `BelongsToMany` | local key (`id`) | related primary key, joined through the pivot |
//! | `MorphOne` / `MorphMany` | local key (`id`) | morph id column (`commentable_id`) |
//! | `MorphTo` | morph id column on parent | primary key of the resolved model |

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
    BelongsToMany,
    MorphOne,
    MorphMany,
    MorphTo,
}

impl RelationKind {
    /// Whether the relation loads a collection.
    pub fn is_many(self) -> bool {
        matches!(
            self,
            RelationKind::HasMany | RelationKind::BelongsToMany | RelationKind::MorphMany
        )
    }

    pub fn is_polymorphic(self) -> bool {
        matches!(
            self,
            RelationKind::MorphOne | RelationKind::MorphMany | RelationKind::MorphTo
        )
    }
}

/// Join table of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pivot {
    pub table: String,
    /// Pivot column referencing the parent.
    pub foreign_pivot_key: String,
    /// Pivot column referencing the related model.
    pub related_pivot_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipMeta {
    pub name: String,
    pub kind: RelationKind,
    /// Related model name. `None` for `MorphTo`, which resolves per row.
    pub related: Option<String>,
    pub parent_key: String,
    pub related_key: String,
    pub pivot: Option<Pivot>,
    /// Discriminator column: on the related table for `MorphOne`/`MorphMany`,
    /// on the parent for `MorphTo`.
    pub morph_type: Option<String>,
}

impl RelationshipMeta {
    fn base(name: &str, kind: RelationKind, related: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            related: related.map(str::to_string),
            parent_key: "id".to_string(),
            related_key: "id".to_string(),
            pivot: None,
            morph_type: None,
        }
    }

    /// `related.foreign_key = parent.id`, at most one row.
    pub fn has_one(name: &str, related: &str, foreign_key: &str) -> Self {
        Self {
            related_key: foreign_key.to_string(),
            ..Self::base(name, RelationKind::HasOne, Some(related))
        }
    }

    /// `related.foreign_key = parent.id`.
    pub fn has_many(name: &str, related: &str, foreign_key: &str) -> Self {
        Self {
            related_key: foreign_key.to_string(),
            ..Self::base(name, RelationKind::HasMany, Some(related))
        }
    }

    /// `parent.foreign_key = related.id`.
    pub fn belongs_to(name: &str, related: &str, foreign_key: &str) -> Self {
        Self {
            parent_key: foreign_key.to_string(),
            ..Self::base(name, RelationKind::BelongsTo, Some(related))
        }
    }

    /// Many-to-many through `pivot_table`.
    pub fn belongs_to_many(
        name: &str,
        related: &str,
        pivot_table: &str,
        foreign_pivot_key: &str,
        related_pivot_key: &str,
    ) -> Self {
        Self {
            pivot: Some(Pivot {
                table: pivot_table.to_string(),
                foreign_pivot_key: foreign_pivot_key.to_string(),
                related_pivot_key: related_pivot_key.to_string(),
            }),
            ..Self::base(name, RelationKind::BelongsToMany, Some(related))
        }
    }

    /// Polymorphic one-to-one; `morph_name` expands to `{morph_name}_id` / `{morph_name}_type`.
    pub fn morph_one(name: &str, related: &str, morph_name: &str) -> Self {
        Self {
            related_key: format!("{morph_name}_id"),
            morph_type: Some(format!("{morph_name}_type")),
            ..Self::base(name, RelationKind::MorphOne, Some(related))
        }
    }

    pub fn morph_many(name: &str, related: &str, morph_name: &str) -> Self {
        Self {
            related_key: format!("{morph_name}_id"),
            morph_type: Some(format!("{morph_name}_type")),
            ..Self::base(name, RelationKind::MorphMany, Some(related))
        }
    }

    /// Inverse of a morph relation: the parent row names its owner's type and id.
    pub fn morph_to(name: &str, morph_name: &str) -> Self {
        Self {
            parent_key: format!("{morph_name}_id"),
            morph_type: Some(format!("{morph_name}_type")),
            ..Self::base(name, RelationKind::MorphTo, None)
        }
    }

    /// Override the parent-side column (local key / foreign key on parent).
    pub fn parent_key(mut self, column: &str) -> Self {
        self.parent_key = column.to_string();
        self
    }

    /// Override the related-side column (foreign key / owner key).
    pub fn related_key(mut self, column: &str) -> Self {
        self.related_key = column.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_fill_key_columns() {
        let posts = RelationshipMeta::has_many("posts", "Post", "user_id");
        assert_eq!((posts.parent_key.as_str(), posts.related_key.as_str()), ("id", "user_id"));
        assert!(posts.kind.is_many());

        let author = RelationshipMeta::belongs_to("author", "User", "user_id");
        assert_eq!((author.parent_key.as_str(), author.related_key.as_str()), ("user_id", "id"));

        let owner = RelationshipMeta::morph_to("commentable", "commentable");
        assert_eq!(owner.parent_key, "commentable_id");
        assert_eq!(owner.morph_type.as_deref(), Some("commentable_type"));
        assert!(owner.related.is_none());
    }
}
