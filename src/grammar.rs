//! Loader for the ASN.1 module subset used by CDR-style schemas.
//!
//! Handles type assignments with optional `[CLASS n]` tags and
//! IMPLICIT/EXPLICIT keywords, SEQUENCE / SET (with COMPONENTS OF),
//! SEQUENCE OF / SET OF, tagged and untagged CHOICE, ANY DEFINED BY,
//! aliases and the usual built-in types. Constraints, named numbers and
//! DEFAULT values are skipped. All tags are treated as implicit.

use crate::error::SchemaError;
use crate::schema::{Schema, TypeDefinition, TypeTag};
use crate::tag::{Tag, TagClass, TagEncoding};
use log::{debug, warn};
use regex::Regex;
use std::collections::HashMap;

/// Parse `text` and build a schema whose top-level types are `roots`.
///
/// With no roots given, the first assignment in the module is used.
pub fn parse(text: &str, roots: &[&str], encoding: TagEncoding) -> Result<Schema, SchemaError> {
    let grammar = Grammar::parse(text)?;
    let roots: Vec<String> = if roots.is_empty() {
        grammar.order.first().cloned().into_iter().collect()
    } else {
        roots.iter().map(|r| r.to_string()).collect()
    };
    if roots.is_empty() {
        return Err(SchemaError::Syntax("grammar declares no types".to_string()));
    }

    let mut resolver = Resolver {
        grammar: &grammar,
        done: HashMap::new(),
        visiting: Vec::new(),
    };
    let mut builder = Schema::builder().tag_encoding(encoding);
    for root in &roots {
        if !grammar.decls.contains_key(root) {
            return Err(SchemaError::UnknownRoot { name: root.clone() });
        }
        builder = builder.root(resolver.named(root, "<root>")?);
    }
    for (name, def) in resolver.done {
        if !roots.contains(&name) {
            builder = builder.define(def);
        }
    }
    builder.build()
}

#[derive(Debug, Clone)]
enum Body {
    Builtin(TypeTag),
    Reference(String),
    Sequence(Vec<Item>),
    Set(Vec<Item>),
    SequenceOf(Box<Body>),
    SetOf(Box<Body>),
    Choice(Vec<Item>),
    Any(String),
}

#[derive(Debug, Clone)]
enum Item {
    Component {
        name: String,
        tag: Option<Tag>,
        ty: Body,
        optional: bool,
    },
    ComponentsOf(String),
}

#[derive(Debug)]
struct Decl {
    tag: Option<Tag>,
    body: Body,
}

struct Patterns {
    tag_prefix: Regex,
    components_of: Regex,
    two_word: Regex,
    optional: Regex,
}

impl Patterns {
    fn new() -> Result<Self, SchemaError> {
        let compile = |re: &str| Regex::new(re).map_err(|e| SchemaError::Syntax(e.to_string()));
        Ok(Self {
            tag_prefix: compile(
                r"(?s)^\s*(?:\[\s*(?:(APPLICATION|UNIVERSAL|PRIVATE|CONTEXT|CONTEXT-SPECIFIC)\s+)?(\d+)\s*\])?\s*(?:(?:IMPLICIT|EXPLICIT)\s+)?(.*)$",
            )?,
            components_of: compile(r"(?s)^\s*COMPONENTS\s+OF\s+([\w-]+)\s*$")?,
            two_word: compile(r"^(OCTET\s+STRING|BIT\s+STRING|OBJECT\s+IDENTIFIER)\b")?,
            optional: compile(r"\b(OPTIONAL|DEFAULT)\b")?,
        })
    }

    /// Split a leading `[CLASS n] IMPLICIT` off `text`.
    fn tagged<'t>(&self, text: &'t str) -> Result<(Option<Tag>, &'t str), String> {
        let caps = self
            .tag_prefix
            .captures(text)
            .ok_or_else(|| format!("cannot parse '{}'", snippet(text)))?;
        let tag = match caps.get(2) {
            Some(number) => {
                let number: u32 = number
                    .as_str()
                    .parse()
                    .map_err(|_| format!("tag number {} out of range", number.as_str()))?;
                let class = TagClass::from_keyword(caps.get(1).map(|m| m.as_str()));
                Some(Tag::new(class, false, number))
            }
            None => None,
        };
        let rest = caps.get(3).map_or("", |m| m.as_str());
        Ok((tag, rest))
    }

    /// Parse the type at the start of `text`, returning what follows it.
    fn type_spec<'t>(&self, text: &'t str) -> Result<(Body, &'t str), String> {
        let t = text.trim_start();
        if let Some(rest) = keyword(t, "CHOICE") {
            let (inner, rest) = braced(rest)?;
            return Ok((Body::Choice(self.items(inner)?), rest));
        }
        for (kw, is_set) in [("SEQUENCE", false), ("SET", true)] {
            let Some(rest) = keyword(t, kw) else { continue };
            let rest = skip_constraints(rest)?;
            if let Some(rest) = keyword(rest.trim_start(), "OF") {
                let (element, rest) = self.type_spec(rest)?;
                let element = Box::new(element);
                let body = if is_set {
                    Body::SetOf(element)
                } else {
                    Body::SequenceOf(element)
                };
                return Ok((body, rest));
            }
            let (inner, rest) = braced(rest)?;
            let items = self.items(inner)?;
            let body = if is_set {
                Body::Set(items)
            } else {
                Body::Sequence(items)
            };
            return Ok((body, rest));
        }
        if let Some(rest) = keyword(t, "ANY") {
            let Some(rest) = keyword(rest.trim_start(), "DEFINED") else {
                return Ok((Body::Any(String::new()), rest));
            };
            let rest = keyword(rest.trim_start(), "BY").ok_or("expected BY after ANY DEFINED")?;
            let (field, rest) = ident(rest)?;
            return Ok((Body::Any(field.to_string()), rest));
        }

        let (word, rest) = match self.two_word.find(t) {
            Some(m) => (m.as_str(), &t[m.end()..]),
            None => ident(t)?,
        };
        // INTEGER / ENUMERATED / BIT STRING named values
        let rest = match rest.trim_start() {
            r if r.starts_with('{') => braced(r)?.1,
            r => r,
        };
        let rest = skip_constraints(rest)?;
        let body = match TypeTag::from_keyword(word) {
            Some(ty) => Body::Builtin(ty),
            None => Body::Reference(word.to_string()),
        };
        Ok((body, rest))
    }

    /// Components of a SEQUENCE / SET body or alternatives of a CHOICE.
    fn items(&self, body: &str) -> Result<Vec<Item>, String> {
        let mut items = Vec::new();
        for piece in split_top_level(body) {
            let piece = piece.trim();
            if piece.is_empty() || piece.starts_with("...") {
                continue;
            }
            if let Some(caps) = self.components_of.captures(piece) {
                items.push(Item::ComponentsOf(caps[1].to_string()));
                continue;
            }
            let (name, rest) = ident(piece)?;
            let (tag, rest) = self.tagged(rest)?;
            let (ty, rest) = self
                .type_spec(rest)
                .map_err(|e| format!("component {}: {}", name, e))?;
            items.push(Item::Component {
                name: name.to_string(),
                tag,
                ty,
                optional: self.optional.is_match(rest),
            });
        }
        Ok(items)
    }
}

struct Grammar {
    decls: HashMap<String, Decl>,
    /// Assignment names in source order.
    order: Vec<String>,
}

impl Grammar {
    fn parse(text: &str) -> Result<Self, SchemaError> {
        let syntax = |e: regex::Error| SchemaError::Syntax(e.to_string());
        let snacc_directive_re = Regex::new(r"(?is)--\s*snacc\b.*?--").map_err(syntax)?;
        let comment_strip_re = Regex::new(r"(?m)--.*?$").map_err(syntax)?;
        let assignment_re = Regex::new(r"(?m)^[ \t]*([\w-]+)[ \t]*::=").map_err(syntax)?;
        let patterns = Patterns::new()?;

        let no_snacc = snacc_directive_re.replace_all(text, " ");
        let stripped = comment_strip_re.replace_all(&no_snacc, "");

        let starts: Vec<_> = assignment_re.captures_iter(&stripped).collect();
        let mut grammar = Grammar {
            decls: HashMap::new(),
            order: Vec::new(),
        };
        for (i, caps) in starts.iter().enumerate() {
            let name = caps[1].to_string();
            let rhs_start = caps.get(0).map_or(0, |m| m.end());
            let rhs_end = starts
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(stripped.len(), |m| m.start());
            let rhs = &stripped[rhs_start..rhs_end];
            if keyword(rhs.trim_start(), "BEGIN").is_some() {
                continue;
            }

            let decl = patterns
                .tagged(rhs)
                .and_then(|(tag, rest)| Ok(Decl { tag, body: patterns.type_spec(rest)?.0 }))
                .map_err(|e| SchemaError::Syntax(format!("in {}: {}", name, e)))?;
            if grammar.decls.insert(name.clone(), decl).is_some() {
                warn!("type {} assigned more than once; keeping the last", name);
            } else {
                grammar.order.push(name);
            }
        }
        debug!("grammar declares {} types", grammar.order.len());
        Ok(grammar)
    }
}

/// Turns parsed declarations into shared definitions.
struct Resolver<'g> {
    grammar: &'g Grammar,
    done: HashMap<String, TypeDefinition>,
    visiting: Vec<String>,
}

impl Resolver<'_> {
    fn named(&mut self, name: &str, from: &str) -> Result<TypeDefinition, SchemaError> {
        if let Some(def) = self.done.get(name) {
            return Ok(def.clone());
        }
        let grammar = self.grammar;
        let Some(decl) = grammar.decls.get(name) else {
            return match TypeTag::from_keyword(name) {
                Some(ty) => Ok(TypeDefinition::primitive(name, ty)),
                None => Err(SchemaError::UnknownType {
                    name: name.to_string(),
                    from: from.to_string(),
                }),
            };
        };
        if self.visiting.iter().any(|v| v == name) {
            return Err(SchemaError::RecursiveType {
                name: name.to_string(),
            });
        }

        self.visiting.push(name.to_string());
        let def = self.body(name, &decl.body)?;
        self.visiting.pop();

        let def = match decl.tag {
            Some(tag) => def.with_tag(tag),
            None => def,
        };
        self.done.insert(name.to_string(), def.clone());
        Ok(def)
    }

    fn body(&mut self, name: &str, body: &Body) -> Result<TypeDefinition, SchemaError> {
        match body {
            Body::Builtin(ty) => Ok(TypeDefinition::primitive(name, *ty)),
            Body::Reference(target) => Ok(self.named(target, name)?.renamed(name)),
            Body::Sequence(items) => TypeDefinition::sequence(name, self.components(name, items)?),
            Body::Set(items) => TypeDefinition::set(name, self.components(name, items)?),
            Body::SequenceOf(element) => {
                Ok(TypeDefinition::sequence_of(name, self.element(name, element)?))
            }
            Body::SetOf(element) => Ok(TypeDefinition::set_of(name, self.element(name, element)?)),
            Body::Choice(items) => TypeDefinition::choice(name, self.components(name, items)?),
            Body::Any(defined_by) => Ok(TypeDefinition::any_defined_by(name, defined_by.clone())),
        }
    }

    /// Element of a SEQUENCE OF / SET OF: named after its type, or after
    /// the collection when declared inline.
    fn element(&mut self, parent: &str, body: &Body) -> Result<TypeDefinition, SchemaError> {
        match body {
            Body::Reference(target) => self.named(target, parent),
            other => self.body(parent, other),
        }
    }

    fn components(&mut self, parent: &str, items: &[Item]) -> Result<Vec<TypeDefinition>, SchemaError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Item::ComponentsOf(source) => {
                    let def = self.named(source, parent)?;
                    let components = def.components().ok_or_else(|| {
                        SchemaError::Syntax(format!(
                            "COMPONENTS OF {} in {}: not a SEQUENCE or SET",
                            source, parent
                        ))
                    })?;
                    out.extend(components.iter().map(|c| (**c).clone()));
                }
                Item::Component {
                    name,
                    tag,
                    ty,
                    optional,
                } => {
                    let mut def = match ty {
                        Body::Reference(target) => self.named(target, parent)?.renamed(name.as_str()),
                        other => self.body(name, other)?,
                    };
                    if let Some(tag) = tag {
                        def = def.with_tag(*tag);
                    }
                    if *optional {
                        def = def.optional();
                    }
                    out.push(def);
                }
            }
        }
        Ok(out)
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// `text` minus a leading keyword that ends on a word boundary.
fn keyword<'t>(text: &'t str, kw: &str) -> Option<&'t str> {
    let rest = text.strip_prefix(kw)?;
    match rest.bytes().next() {
        Some(b) if is_word_byte(b) => None,
        _ => Some(rest),
    }
}

fn ident(text: &str) -> Result<(&str, &str), String> {
    let t = text.trim_start();
    let end = t.bytes().position(|b| !is_word_byte(b)).unwrap_or(t.len());
    if end == 0 {
        return Err(format!("expected a name near '{}'", snippet(t)));
    }
    Ok((&t[..end], &t[end..]))
}

/// Contents of the `{ ... }` group at the start of `text`, and what follows.
fn braced(text: &str) -> Result<(&str, &str), String> {
    let t = text.trim_start();
    if !t.starts_with('{') {
        return Err(format!("expected '{{' near '{}'", snippet(t)));
    }
    let close = matching(t, b'{', b'}').ok_or("unbalanced '{'")?;
    Ok((&t[1..close], &t[close + 1..]))
}

fn skip_constraints(text: &str) -> Result<&str, String> {
    let mut t = text.trim_start();
    while t.starts_with('(') {
        let close = matching(t, b'(', b')').ok_or("unbalanced '('")?;
        t = t[close + 1..].trim_start();
    }
    Ok(t)
}

/// Index of the delimiter closing the one at position 0.
fn matching(text: &str, open: u8, close: u8) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in text.bytes().enumerate() {
        if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Split on commas that are not nested in braces or parentheses.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, b) in body.bytes().enumerate() {
        match b {
            b'{' | b'(' => depth += 1,
            b'}' | b')' => depth -= 1,
            b',' if depth == 0 => {
                pieces.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&body[start..]);
    pieces
}

fn snippet(text: &str) -> &str {
    let end = text.char_indices().nth(40).map_or(text.len(), |(i, _)| i);
    &text[..end]
}
