//! In-memory element trees.
//!
//! [`TreeBuilder`] listens either to raw structural events (untyped tree)
//! or to the mapper's semantic events (tree annotated with schema names
//! and declared types). A node is attached to its parent only once it
//! closes, so a failed record never leaves half-built children behind.

use crate::error::{Error, Result};
use crate::mapper::{FieldEvent, SemanticSink};
use crate::schema::{TypeDefinition, TypeTag};
use crate::tag::{Tag, TagEncoding};
use crate::tlv::{Header, TlvReader, TlvVisitor};
use std::io::Read;
use std::mem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBody {
    /// `None` when the value was nulled by recovery.
    Primitive(Option<Vec<u8>>),
    Constructed(Vec<Node>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// `None` for a component substituted because it never appeared.
    pub tag: Option<Tag>,
    pub name: Option<String>,
    pub declared_type: Option<TypeTag>,
    pub offset: u64,
    pub length: u32,
    pub body: NodeBody,
}

impl Node {
    fn open(header: &Header, constructed: bool) -> Self {
        Node {
            tag: Some(header.tag),
            name: None,
            declared_type: None,
            offset: header.offset,
            length: header.length,
            body: if constructed {
                NodeBody::Constructed(Vec::new())
            } else {
                NodeBody::Primitive(None)
            },
        }
    }

    pub fn is_constructed(&self) -> bool {
        matches!(self.body, NodeBody::Constructed(_))
    }

    pub fn children(&self) -> &[Node] {
        match &self.body {
            NodeBody::Constructed(children) => children,
            NodeBody::Primitive(_) => &[],
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match &self.body {
            NodeBody::Primitive(value) => value.as_deref(),
            NodeBody::Constructed(_) => None,
        }
    }

    /// First child with the given schema name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children().iter().find(|c| c.name.as_deref() == Some(name))
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(Node::node_count).sum::<usize>()
    }
}

/// Builds [`Node`] trees from either event layer.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    stack: Vec<Node>,
    roots: Vec<Node>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed top-level trees, oldest first.
    pub fn take_roots(&mut self) -> Vec<Node> {
        mem::take(&mut self.roots)
    }

    /// Most recently completed top-level tree.
    pub fn take_root(&mut self) -> Option<Node> {
        self.roots.pop()
    }

    /// Throw away a partially built tree.
    pub fn discard(&mut self) {
        self.stack.clear();
    }

    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    fn attach(&mut self, node: Node) -> Result<()> {
        match self.stack.last_mut() {
            None => {
                self.roots.push(node);
                Ok(())
            }
            Some(Node {
                body: NodeBody::Constructed(children),
                ..
            }) => {
                children.push(node);
                Ok(())
            }
            Some(_) => Err(Error::state("", "child closed inside a primitive node")),
        }
    }

    fn close(&mut self) -> Result<()> {
        let node = self
            .stack
            .pop()
            .ok_or_else(|| Error::state("", "mismatched end tag"))?;
        self.attach(node)
    }

    fn set_value(&mut self, value: Option<&[u8]>) -> Result<()> {
        match self.stack.last_mut() {
            Some(Node {
                body: NodeBody::Primitive(slot),
                ..
            }) => {
                *slot = value.map(<[u8]>::to_vec);
                Ok(())
            }
            Some(_) => Err(Error::state("", "primitive value for constructed node")),
            None => Err(Error::state("", "value with empty state")),
        }
    }
}

impl TlvVisitor for TreeBuilder {
    fn start_element(&mut self, header: &Header) -> Result<()> {
        self.stack.push(Node::open(header, header.is_constructed()));
        Ok(())
    }

    fn primitive_value(&mut self, value: &[u8]) -> Result<()> {
        self.set_value(Some(value))
    }

    fn end_element(&mut self, _tag: Tag) -> Result<()> {
        self.close()
    }
}

impl SemanticSink for TreeBuilder {
    fn enter(&mut self, def: &TypeDefinition, header: &Header) -> Result<()> {
        let constructed = def.expects_constructed() == Some(true) && header.is_constructed();
        let mut node = Node::open(header, constructed);
        node.name = Some(def.name().to_string());
        node.declared_type = Some(def.declared_type());
        self.stack.push(node);
        Ok(())
    }

    fn field(&mut self, field: FieldEvent<'_>) -> Result<()> {
        self.set_value(field.value)
    }

    fn leave(&mut self) -> Result<()> {
        self.close()
    }

    fn missing(&mut self, def: &TypeDefinition, _path: &str, offset: u64) -> Result<()> {
        self.attach(Node {
            tag: None,
            name: Some(def.name().to_string()),
            declared_type: Some(def.declared_type()),
            offset,
            length: 0,
            body: NodeBody::Primitive(None),
        })
    }
}

/// Build untyped trees for every top-level element in `source`.
pub fn read_trees<R: Read>(source: R, encoding: TagEncoding) -> Result<Vec<Node>> {
    let mut builder = TreeBuilder::new();
    TlvReader::new(source)
        .with_tag_encoding(encoding)
        .process(&mut builder)?;
    Ok(builder.take_roots())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::SemanticMapper;
    use crate::schema::Schema;
    use hex_literal::hex;

    #[test]
    fn untyped_tree_mirrors_nesting() {
        let roots = read_trees(&hex!("30 06 02 01 05 04 01 41")[..], TagEncoding::SingleOctet).unwrap();
        assert_eq!(roots.len(), 1);
        let root = &roots[0];
        assert_eq!(root.tag, Some(Tag::SEQUENCE));
        assert_eq!(root.children().len(), 2);
        assert_eq!(root.children()[1].value(), Some(&[0x41][..]));
        assert_eq!(root.node_count(), 3);
    }

    #[test]
    fn empty_input_has_no_root() {
        assert!(read_trees(&[][..], TagEncoding::SingleOctet).unwrap().is_empty());
    }

    #[test]
    fn one_root_per_top_level_element() {
        let roots = read_trees(&hex!("02 01 01 02 01 02")[..], TagEncoding::SingleOctet).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[1].value(), Some(&[0x02][..]));
    }

    #[test]
    fn typed_tree_carries_names() {
        let schema = Schema::builder()
            .root(
                TypeDefinition::sequence(
                    "msg",
                    vec![
                        TypeDefinition::primitive("id", TypeTag::Integer),
                        TypeDefinition::primitive("payload", TypeTag::OctetString).optional(),
                    ],
                )
                .unwrap(),
            )
            .build()
            .unwrap();
        let mut mapper = SemanticMapper::new(&schema, TreeBuilder::new());
        TlvReader::new(&hex!("30 06 02 01 05 04 01 41")[..])
            .process(&mut mapper)
            .unwrap();
        let root = mapper.sink_mut().take_root().unwrap();
        assert_eq!(root.name.as_deref(), Some("msg"));
        assert_eq!(root.declared_type, Some(TypeTag::Sequence));
        let id = root.child("id").unwrap();
        assert_eq!(id.declared_type, Some(TypeTag::Integer));
        assert_eq!(id.value(), Some(&[0x05][..]));
    }

    #[test]
    fn missing_component_becomes_null_leaf() {
        let schema = Schema::builder()
            .root(
                TypeDefinition::sequence("msg", vec![TypeDefinition::primitive("id", TypeTag::Integer)])
                    .unwrap(),
            )
            .build()
            .unwrap();
        let mut mapper =
            SemanticMapper::new(&schema, TreeBuilder::new()).with_field_recovery(true);
        TlvReader::new(&hex!("30 00")[..]).process(&mut mapper).unwrap();
        let root = mapper.sink_mut().take_root().unwrap();
        let id = root.child("id").unwrap();
        assert_eq!(id.tag, None);
        assert_eq!(id.value(), None);
    }

    #[test]
    fn discard_drops_partial_tree() {
        let mut builder = TreeBuilder::new();
        let header = Header::new(Tag::SEQUENCE, 4, 0);
        TlvVisitor::start_element(&mut builder, &header).unwrap();
        assert!(!builder.is_idle());
        builder.discard();
        assert!(builder.is_idle());
        assert!(builder.take_roots().is_empty());
    }
}
