//! Tag-indexed, immutable schema model.
//!
//! A [`Schema`] is a catalogue of named [`TypeDefinition`]s plus the set of
//! definitions that may appear at the top level of a stream. Lookups are pure
//! functions of the schema and a tag, so one schema can be shared (`&Schema`
//! or `Arc<Schema>`) by any number of independent decode pipelines.

use crate::error::SchemaError;
use crate::tag::{Tag, TagEncoding, TagKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Declared ASN.1 type carried alongside raw field bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    Integer,
    Boolean,
    Null,
    Enumerated,
    Real,
    OctetString,
    BitString,
    ObjectIdentifier,
    Utf8String,
    Ia5String,
    PrintableString,
    VisibleString,
    NumericString,
    GraphicString,
    GeneralString,
    BmpString,
    TbcdString,
    UtcTime,
    GeneralizedTime,
    Sequence,
    SequenceOf,
    Set,
    SetOf,
    Choice,
    Any,
}

impl TypeTag {
    /// Map a grammar keyword (`OCTET STRING`, `IA5String`, ...) to a type.
    pub fn from_keyword(word: &str) -> Option<Self> {
        let normalized: String = word.split_whitespace().collect::<Vec<_>>().join(" ");
        Some(match normalized.as_str() {
            "INTEGER" => TypeTag::Integer,
            "BOOLEAN" => TypeTag::Boolean,
            "NULL" => TypeTag::Null,
            "ENUMERATED" => TypeTag::Enumerated,
            "REAL" => TypeTag::Real,
            "OCTET STRING" => TypeTag::OctetString,
            "BIT STRING" => TypeTag::BitString,
            "OBJECT IDENTIFIER" => TypeTag::ObjectIdentifier,
            "UTF8String" => TypeTag::Utf8String,
            "IA5String" => TypeTag::Ia5String,
            "PrintableString" => TypeTag::PrintableString,
            "VisibleString" => TypeTag::VisibleString,
            "NumericString" => TypeTag::NumericString,
            "GraphicString" => TypeTag::GraphicString,
            "GeneralString" => TypeTag::GeneralString,
            "BMPString" => TypeTag::BmpString,
            "TBCD-STRING" => TypeTag::TbcdString,
            "UTCTime" => TypeTag::UtcTime,
            "GeneralizedTime" => TypeTag::GeneralizedTime,
            _ => return None,
        })
    }

    /// Universal tag an untagged value of this type is encoded with.
    pub fn universal_tag(self) -> Option<Tag> {
        let number = match self {
            TypeTag::Boolean => 1,
            TypeTag::Integer => 2,
            TypeTag::BitString => 3,
            TypeTag::OctetString | TypeTag::TbcdString => 4,
            TypeTag::Null => 5,
            TypeTag::ObjectIdentifier => 6,
            TypeTag::Real => 9,
            TypeTag::Enumerated => 10,
            TypeTag::Utf8String => 12,
            TypeTag::Sequence | TypeTag::SequenceOf => return Some(Tag::SEQUENCE),
            TypeTag::Set | TypeTag::SetOf => return Some(Tag::SET),
            TypeTag::NumericString => 18,
            TypeTag::PrintableString => 19,
            TypeTag::Ia5String => 22,
            TypeTag::UtcTime => 23,
            TypeTag::GeneralizedTime => 24,
            TypeTag::GraphicString => 25,
            TypeTag::VisibleString => 26,
            TypeTag::GeneralString => 27,
            TypeTag::BmpString => 30,
            TypeTag::Choice | TypeTag::Any => return None,
        };
        Some(Tag::universal(number))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TypeTag::Integer => "INTEGER",
            TypeTag::Boolean => "BOOLEAN",
            TypeTag::Null => "NULL",
            TypeTag::Enumerated => "ENUMERATED",
            TypeTag::Real => "REAL",
            TypeTag::OctetString => "OCTET STRING",
            TypeTag::BitString => "BIT STRING",
            TypeTag::ObjectIdentifier => "OBJECT IDENTIFIER",
            TypeTag::Utf8String => "UTF8String",
            TypeTag::Ia5String => "IA5String",
            TypeTag::PrintableString => "PrintableString",
            TypeTag::VisibleString => "VisibleString",
            TypeTag::NumericString => "NumericString",
            TypeTag::GraphicString => "GraphicString",
            TypeTag::GeneralString => "GeneralString",
            TypeTag::BmpString => "BMPString",
            TypeTag::TbcdString => "TBCD-STRING",
            TypeTag::UtcTime => "UTCTime",
            TypeTag::GeneralizedTime => "GeneralizedTime",
            TypeTag::Sequence => "SEQUENCE",
            TypeTag::SequenceOf => "SEQUENCE OF",
            TypeTag::Set => "SET",
            TypeTag::SetOf => "SET OF",
            TypeTag::Choice => "CHOICE",
            TypeTag::Any => "ANY",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered components of a SEQUENCE or SET.
#[derive(Debug, Clone, Default)]
pub struct Components {
    items: Vec<Arc<TypeDefinition>>,
}

impl Components {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TypeDefinition>> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// First component claiming `tag`; ANY DEFINED BY components catch
    /// whatever no tagged component claims.
    fn find(&self, tag: &Tag) -> Option<(usize, &Arc<TypeDefinition>)> {
        let mut fallback = None;
        for (i, component) in self.items.iter().enumerate() {
            if let Some(found) = component.claim(tag) {
                return Some((i, found));
            }
            if fallback.is_none() && matches!(component.kind, TypeKind::AnyDefinedBy { .. }) {
                fallback = Some((i, component));
            }
        }
        fallback
    }
}

/// Alternatives of a CHOICE, indexed by tag.
#[derive(Debug, Clone, Default)]
pub struct Alternatives {
    items: Vec<Arc<TypeDefinition>>,
    index: HashMap<TagKey, Arc<TypeDefinition>>,
}

impl Alternatives {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TypeDefinition>> {
        self.items.iter()
    }

    pub fn get(&self, tag: &Tag) -> Option<&Arc<TypeDefinition>> {
        self.index.get(&tag.key())
    }
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Primitive(TypeTag),
    Sequence(Components),
    Set(Components),
    SequenceOf(Arc<TypeDefinition>),
    SetOf(Arc<TypeDefinition>),
    Choice(Alternatives),
    /// Concrete type is selected by the value of the sibling `defined_by`.
    AnyDefinedBy { defined_by: String },
}

/// One named, tagged type: a top-level record, a component or an alternative.
#[derive(Debug, Clone)]
pub struct TypeDefinition {
    name: String,
    tag: Option<Tag>,
    optional: bool,
    kind: TypeKind,
}

impl TypeDefinition {
    pub fn primitive(name: impl Into<String>, ty: TypeTag) -> Self {
        Self {
            name: name.into(),
            tag: ty.universal_tag(),
            optional: false,
            kind: TypeKind::Primitive(ty),
        }
    }

    pub fn sequence(
        name: impl Into<String>,
        components: Vec<TypeDefinition>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        let components = build_components(&name, components)?;
        Ok(Self {
            name,
            tag: Some(Tag::SEQUENCE),
            optional: false,
            kind: TypeKind::Sequence(components),
        })
    }

    pub fn set(name: impl Into<String>, components: Vec<TypeDefinition>) -> Result<Self, SchemaError> {
        let name = name.into();
        let components = build_components(&name, components)?;
        Ok(Self {
            name,
            tag: Some(Tag::SET),
            optional: false,
            kind: TypeKind::Set(components),
        })
    }

    pub fn sequence_of(name: impl Into<String>, element: TypeDefinition) -> Self {
        Self {
            name: name.into(),
            tag: Some(Tag::SEQUENCE),
            optional: false,
            kind: TypeKind::SequenceOf(Arc::new(element)),
        }
    }

    pub fn set_of(name: impl Into<String>, element: TypeDefinition) -> Self {
        Self {
            name: name.into(),
            tag: Some(Tag::SET),
            optional: false,
            kind: TypeKind::SetOf(Arc::new(element)),
        }
    }

    /// An untagged CHOICE; give it a tag with [`with_tag`](Self::with_tag)
    /// to make it an explicit wrapper element.
    pub fn choice(
        name: impl Into<String>,
        alternatives: Vec<TypeDefinition>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        let mut alts = Alternatives::default();
        for alt in alternatives {
            let alt = Arc::new(alt);
            for (key, target) in alt.claimed_keys(&alt)? {
                if let Some(existing) = alts.index.get(&key) {
                    return Err(duplicate(&name, key, existing, &target));
                }
                alts.index.insert(key, target);
            }
            alts.items.push(alt);
        }
        Ok(Self {
            name,
            tag: None,
            optional: false,
            kind: TypeKind::Choice(alts),
        })
    }

    pub fn any_defined_by(name: impl Into<String>, defined_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: None,
            optional: false,
            kind: TypeKind::AnyDefinedBy {
                defined_by: defined_by.into(),
            },
        }
    }

    /// Replace the tag (implicit tagging). The constructed bit follows the kind.
    pub fn with_tag(mut self, tag: Tag) -> Self {
        let constructed = match self.kind {
            TypeKind::Primitive(_) => false,
            TypeKind::AnyDefinedBy { .. } => tag.constructed,
            _ => true,
        };
        self.tag = Some(Tag::new(tag.class, constructed, tag.number));
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<Tag> {
        self.tag
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    pub fn declared_type(&self) -> TypeTag {
        match &self.kind {
            TypeKind::Primitive(ty) => *ty,
            TypeKind::Sequence(_) => TypeTag::Sequence,
            TypeKind::Set(_) => TypeTag::Set,
            TypeKind::SequenceOf(_) => TypeTag::SequenceOf,
            TypeKind::SetOf(_) => TypeTag::SetOf,
            TypeKind::Choice(_) => TypeTag::Choice,
            TypeKind::AnyDefinedBy { .. } => TypeTag::Any,
        }
    }

    /// Whether the schema expects constructed encoding; `None` for ANY.
    pub fn expects_constructed(&self) -> Option<bool> {
        match self.kind {
            TypeKind::Primitive(_) => Some(false),
            TypeKind::AnyDefinedBy { .. } => None,
            _ => Some(true),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self.kind, TypeKind::AnyDefinedBy { .. })
    }

    /// Components of a SEQUENCE or SET.
    pub fn components(&self) -> Option<&Components> {
        match &self.kind {
            TypeKind::Sequence(c) | TypeKind::Set(c) => Some(c),
            _ => None,
        }
    }

    /// Resolve a stream tag to the definition it selects from `self`
    /// viewed as a candidate: a direct tag match, or an alternative when
    /// `self` is an untagged CHOICE.
    fn claim(self: &Arc<Self>, tag: &Tag) -> Option<&Arc<TypeDefinition>> {
        match (&self.tag, &self.kind) {
            (Some(own), _) if own.matches(tag) => Some(self),
            (None, TypeKind::Choice(alts)) => alts.get(tag),
            _ => None,
        }
    }

    /// Keys `this` answers to when it sits in a parent's lookup table.
    fn claimed_keys(
        &self,
        this: &Arc<TypeDefinition>,
    ) -> Result<Vec<(TagKey, Arc<TypeDefinition>)>, SchemaError> {
        match (&self.tag, &self.kind) {
            (Some(tag), _) => Ok(vec![(tag.key(), Arc::clone(this))]),
            (None, TypeKind::Choice(alts)) => Ok(alts
                .index
                .iter()
                .map(|(k, v)| (*k, Arc::clone(v)))
                .collect()),
            (None, TypeKind::AnyDefinedBy { .. }) => Ok(Vec::new()),
            (None, _) => Err(SchemaError::MissingTag {
                name: self.name.clone(),
            }),
        }
    }

    /// Child lookup inside this constructed definition.
    pub fn child(&self, tag: &Tag) -> Result<Option<&Arc<TypeDefinition>>, SchemaError> {
        Ok(self.child_with_index(tag)?.map(|(_, def)| def))
    }

    /// As [`child`](Self::child), also returning the component position for
    /// SEQUENCE/SET parents.
    pub(crate) fn child_with_index(
        &self,
        tag: &Tag,
    ) -> Result<Option<(Option<usize>, &Arc<TypeDefinition>)>, SchemaError> {
        match &self.kind {
            TypeKind::Sequence(components) | TypeKind::Set(components) => {
                Ok(components.find(tag).map(|(i, def)| (Some(i), def)))
            }
            TypeKind::SequenceOf(element) | TypeKind::SetOf(element) => {
                let found = element.claim(tag).or_else(|| element.is_any().then_some(element));
                Ok(found.map(|def| (None, def)))
            }
            TypeKind::Choice(alts) => Ok(alts.get(tag).map(|def| (None, def))),
            TypeKind::Primitive(_) | TypeKind::AnyDefinedBy { .. } => {
                Err(SchemaError::NotConstructed {
                    name: self.name.clone(),
                })
            }
        }
    }
}

fn build_components(
    parent: &str,
    components: Vec<TypeDefinition>,
) -> Result<Components, SchemaError> {
    let mut seen: HashMap<TagKey, Arc<TypeDefinition>> = HashMap::new();
    let mut items = Vec::with_capacity(components.len());
    for component in components {
        let component = Arc::new(component);
        for (key, target) in component.claimed_keys(&component)? {
            if let Some(existing) = seen.get(&key) {
                return Err(duplicate(parent, key, existing, &target));
            }
            seen.insert(key, target);
        }
        items.push(component);
    }
    Ok(Components { items })
}

fn duplicate(parent: &str, key: TagKey, first: &TypeDefinition, second: &TypeDefinition) -> SchemaError {
    SchemaError::DuplicateTag {
        parent: parent.to_string(),
        tag: format!("[{} {}]", key.0, key.1),
        first: first.name.clone(),
        second: second.name.clone(),
    }
}

/// The schema consumed by the mapper.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: HashMap<String, Arc<TypeDefinition>>,
    roots: Vec<Arc<TypeDefinition>>,
    root_index: HashMap<TagKey, Arc<TypeDefinition>>,
    tag_encoding: TagEncoding,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Definition registered for a top-level tag.
    pub fn resolve_top_level(&self, tag: &Tag) -> Option<&Arc<TypeDefinition>> {
        self.root_index.get(&tag.key())
    }

    /// Definition a nested `tag` selects inside `parent`.
    ///
    /// Calling this with a primitive or ANY parent is a usage error.
    pub fn resolve_child<'d>(
        &self,
        parent: &'d TypeDefinition,
        tag: &Tag,
    ) -> Result<Option<&'d Arc<TypeDefinition>>, SchemaError> {
        parent.child(tag)
    }

    pub fn type_named(&self, name: &str) -> Option<&Arc<TypeDefinition>> {
        self.types.get(name)
    }

    pub fn roots(&self) -> &[Arc<TypeDefinition>] {
        &self.roots
    }

    pub fn tag_encoding(&self) -> TagEncoding {
        self.tag_encoding
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}

/// Collects named definitions and top-level roots.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    types: HashMap<String, Arc<TypeDefinition>>,
    roots: Vec<Arc<TypeDefinition>>,
    root_names: Vec<String>,
    tag_encoding: TagEncoding,
}

impl SchemaBuilder {
    /// Register a named definition without making it a root.
    pub fn define(mut self, def: TypeDefinition) -> Self {
        self.types.insert(def.name.clone(), Arc::new(def));
        self
    }

    /// Register a definition that may appear at depth zero.
    pub fn root(mut self, def: TypeDefinition) -> Self {
        let def = Arc::new(def);
        self.types.insert(def.name.clone(), Arc::clone(&def));
        self.roots.push(def);
        self
    }

    /// Promote an already defined type to a root; checked in [`build`](Self::build).
    pub fn root_named(mut self, name: impl Into<String>) -> Self {
        self.root_names.push(name.into());
        self
    }

    pub fn tag_encoding(mut self, encoding: TagEncoding) -> Self {
        self.tag_encoding = encoding;
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        let mut roots = self.roots;
        for name in self.root_names {
            let def = self
                .types
                .get(&name)
                .ok_or_else(|| SchemaError::UnknownRoot { name: name.clone() })?;
            roots.push(Arc::clone(def));
        }

        let mut root_index: HashMap<TagKey, Arc<TypeDefinition>> = HashMap::new();
        for root in &roots {
            let keys = root.claimed_keys(root)?;
            if keys.is_empty() {
                return Err(SchemaError::MissingTag {
                    name: root.name.clone(),
                });
            }
            for (key, target) in keys {
                if let Some(existing) = root_index.get(&key) {
                    return Err(duplicate("<top level>", key, existing, &target));
                }
                root_index.insert(key, target);
            }
        }

        Ok(Schema {
            types: self.types,
            roots,
            root_index,
            tag_encoding: self.tag_encoding,
        })
    }
}
