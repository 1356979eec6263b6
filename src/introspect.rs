//! The interface description model behind introspection.
//!
//! These types describe what `org.freedesktop.DBus.Introspectable` speaks
//! of: a [`Node`] of interfaces with methods, signals and properties, plus
//! child nodes. The bus generates the XML document from this model; parsing
//! XML back into it is left to external tooling.

use std::fmt::Write;

use crate::error::{Error, ErrorKind, Result};
use crate::signature::SignatureTree;
use crate::validators;

/// The access mode of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    /// The property can only be read.
    Read,
    /// The property can only be written.
    Write,
    /// The property can be read and written.
    ReadWrite,
}

impl PropertyAccess {
    /// Test if the property can be read.
    #[inline]
    pub fn readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    /// Test if the property can be written.
    #[inline]
    pub fn writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }

    fn as_str(self) -> &'static str {
        match self {
            PropertyAccess::Read => "read",
            PropertyAccess::Write => "write",
            PropertyAccess::ReadWrite => "readwrite",
        }
    }
}

/// The direction of a method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgDirection {
    /// An input argument.
    In,
    /// An output argument.
    Out,
}

/// A single argument of a method or signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    name: Option<String>,
    signature: String,
    direction: ArgDirection,
}

impl Arg {
    /// Construct a new argument of a single complete type.
    pub fn new(signature: &str, direction: ArgDirection) -> Result<Self> {
        let tree = SignatureTree::get(signature)?;

        if tree.types().len() != 1 {
            return Err(Error::new(ErrorKind::InvalidIntrospection(
                format!("argument signature `{signature}` must be a single complete type").into(),
            )));
        }

        Ok(Self {
            name: None,
            signature: signature.into(),
            direction,
        })
    }

    /// Set the name of the argument.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The name of the argument, if any.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The signature of the argument.
    #[inline]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The direction of the argument.
    #[inline]
    pub fn direction(&self) -> ArgDirection {
        self.direction
    }
}

/// A method of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    name: String,
    args: Vec<Arg>,
    in_signature: String,
    out_signature: String,
}

impl Method {
    /// Construct a new method description.
    pub fn new(name: &str, args: Vec<Arg>) -> Result<Self> {
        validators::assert_member_name_valid(name)?;

        let mut in_signature = String::new();
        let mut out_signature = String::new();

        for arg in &args {
            match arg.direction {
                ArgDirection::In => in_signature.push_str(&arg.signature),
                ArgDirection::Out => out_signature.push_str(&arg.signature),
            }
        }

        Ok(Self {
            name: name.into(),
            args,
            in_signature,
            out_signature,
        })
    }

    /// The name of the method.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The arguments of the method.
    #[inline]
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// The concatenated signature of the input arguments.
    #[inline]
    pub fn in_signature(&self) -> &str {
        &self.in_signature
    }

    /// The concatenated signature of the output arguments.
    #[inline]
    pub fn out_signature(&self) -> &str {
        &self.out_signature
    }
}

/// A signal of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    name: String,
    args: Vec<Arg>,
    signature: String,
}

impl Signal {
    /// Construct a new signal description. Signal arguments are always
    /// outputs.
    pub fn new(name: &str, args: Vec<Arg>) -> Result<Self> {
        validators::assert_member_name_valid(name)?;

        let signature = args.iter().map(|a| a.signature.as_str()).collect();

        Ok(Self {
            name: name.into(),
            args,
            signature,
        })
    }

    /// The name of the signal.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The arguments of the signal.
    #[inline]
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// The concatenated signature of the signal body.
    #[inline]
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// A property of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    name: String,
    signature: String,
    access: PropertyAccess,
}

impl Property {
    /// Construct a new property description of a single complete type.
    pub fn new(name: &str, signature: &str, access: PropertyAccess) -> Result<Self> {
        validators::assert_member_name_valid(name)?;

        let tree = SignatureTree::get(signature)?;

        if tree.types().len() != 1 {
            return Err(Error::new(ErrorKind::InvalidIntrospection(
                format!("property signature `{signature}` must be a single complete type").into(),
            )));
        }

        Ok(Self {
            name: name.into(),
            signature: signature.into(),
            access,
        })
    }

    /// The name of the property.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The signature of the property.
    #[inline]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The access mode of the property.
    #[inline]
    pub fn access(&self) -> PropertyAccess {
        self.access
    }
}

/// A named group of methods, signals and properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    name: String,
    methods: Vec<Method>,
    signals: Vec<Signal>,
    properties: Vec<Property>,
}

impl Interface {
    /// Construct a new, empty interface description.
    pub fn new(name: &str) -> Result<Self> {
        validators::assert_interface_name_valid(name)?;

        Ok(Self {
            name: name.into(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
        })
    }

    /// Add a method to the interface.
    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    /// Add a signal to the interface.
    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signals.push(signal);
        self
    }

    /// Add a property to the interface.
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// The name of the interface.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The methods of the interface.
    #[inline]
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// The signals of the interface.
    #[inline]
    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    /// The properties of the interface.
    #[inline]
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Look up a signal by name.
    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// An introspected object: interfaces plus child nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    name: Option<String>,
    interfaces: Vec<Interface>,
    nodes: Vec<Node>,
}

impl Node {
    /// Construct a new unnamed node, as used for the root of a document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a new named node, as used for children.
    pub fn with_name(name: &str) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Add an interface to the node.
    pub fn with_interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Add a child node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub(crate) fn push_interface(&mut self, interface: Interface) {
        self.interfaces.push(interface);
    }

    pub(crate) fn push_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// The name of the node, absent on document roots.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The interfaces of the node.
    #[inline]
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// The child nodes of the node.
    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Look up an interface by name.
    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Render the node as an introspection XML document.
    ///
    /// # Examples
    ///
    /// ```
    /// use minibus::introspect::{Interface, Node};
    ///
    /// let node = Node::new().with_interface(Interface::new("com.example.Empty")?);
    /// let xml = node.to_xml();
    ///
    /// assert!(xml.starts_with("<!DOCTYPE node"));
    /// assert!(xml.contains("<interface name=\"com.example.Empty\">"));
    /// # Ok::<_, minibus::Error>(())
    /// ```
    pub fn to_xml(&self) -> String {
        let mut out = String::from(
            "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\" \
             \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n",
        );
        self.write_xml(&mut out, 0);
        out
    }

    fn write_xml(&self, out: &mut String, depth: usize) {
        let pad = Indent(depth);

        match &self.name {
            Some(name) => {
                let _ = write!(out, "{pad}<node name=\"{}\">\n", escape(name));
            }
            None => out.push_str("<node>\n"),
        }

        for interface in &self.interfaces {
            interface.write_xml(out, depth + 1);
        }

        for node in &self.nodes {
            if node.interfaces.is_empty() && node.nodes.is_empty() {
                if let Some(name) = &node.name {
                    let _ = write!(out, "{}<node name=\"{}\"/>\n", Indent(depth + 1), escape(name));
                    continue;
                }
            }

            node.write_xml(out, depth + 1);
        }

        let _ = write!(out, "{pad}</node>\n");
    }
}

impl Interface {
    fn write_xml(&self, out: &mut String, depth: usize) {
        let pad = Indent(depth);
        let inner = Indent(depth + 1);

        let _ = write!(out, "{pad}<interface name=\"{}\">\n", escape(&self.name));

        for method in &self.methods {
            let _ = write!(out, "{inner}<method name=\"{}\">\n", escape(&method.name));

            for arg in &method.args {
                arg.write_xml(out, depth + 2, true);
            }

            let _ = write!(out, "{inner}</method>\n");
        }

        for signal in &self.signals {
            let _ = write!(out, "{inner}<signal name=\"{}\">\n", escape(&signal.name));

            for arg in &signal.args {
                arg.write_xml(out, depth + 2, false);
            }

            let _ = write!(out, "{inner}</signal>\n");
        }

        for property in &self.properties {
            let _ = write!(
                out,
                "{inner}<property name=\"{}\" type=\"{}\" access=\"{}\"/>\n",
                escape(&property.name),
                escape(&property.signature),
                property.access.as_str(),
            );
        }

        let _ = write!(out, "{pad}</interface>\n");
    }
}

impl Arg {
    fn write_xml(&self, out: &mut String, depth: usize, with_direction: bool) {
        let pad = Indent(depth);
        let _ = write!(out, "{pad}<arg");

        if let Some(name) = &self.name {
            let _ = write!(out, " name=\"{}\"", escape(name));
        }

        let _ = write!(out, " type=\"{}\"", escape(&self.signature));

        if with_direction {
            let direction = match self.direction {
                ArgDirection::In => "in",
                ArgDirection::Out => "out",
            };
            let _ = write!(out, " direction=\"{direction}\"");
        }

        out.push_str("/>\n");
    }
}

struct Indent(usize);

impl std::fmt::Display for Indent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for _ in 0..self.0 {
            f.write_str("  ")?;
        }

        Ok(())
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_interface() -> Interface {
        Interface::new("com.example.Player")
            .unwrap()
            .with_method(
                Method::new(
                    "Play",
                    vec![
                        Arg::new("s", ArgDirection::In).unwrap().with_name("uri"),
                        Arg::new("b", ArgDirection::Out).unwrap(),
                    ],
                )
                .unwrap(),
            )
            .with_signal(
                Signal::new("Seeked", vec![Arg::new("x", ArgDirection::Out).unwrap()]).unwrap(),
            )
            .with_property(Property::new("Volume", "d", PropertyAccess::ReadWrite).unwrap())
    }

    #[test]
    fn signatures_are_derived() {
        let interface = player_interface();

        let method = interface.method("Play").unwrap();
        assert_eq!(method.in_signature(), "s");
        assert_eq!(method.out_signature(), "b");

        let signal = interface.signal("Seeked").unwrap();
        assert_eq!(signal.signature(), "x");

        assert!(interface.method("Pause").is_none());
    }

    #[test]
    fn xml_rendering() {
        let node = Node::new()
            .with_interface(player_interface())
            .with_node(Node::with_name("child"));

        let xml = node.to_xml();

        assert!(xml.starts_with("<!DOCTYPE node PUBLIC"));
        assert!(xml.contains("<interface name=\"com.example.Player\">"));
        assert!(xml.contains("<method name=\"Play\">"));
        assert!(xml.contains("<arg name=\"uri\" type=\"s\" direction=\"in\"/>"));
        assert!(xml.contains("<arg type=\"b\" direction=\"out\"/>"));
        assert!(xml.contains("<signal name=\"Seeked\">"));
        // Signal args carry no direction attribute.
        assert!(xml.contains("<arg type=\"x\"/>"));
        assert!(xml.contains("<property name=\"Volume\" type=\"d\" access=\"readwrite\"/>"));
        assert!(xml.contains("<node name=\"child\"/>"));
        assert!(xml.ends_with("</node>\n"));
    }

    #[test]
    fn invalid_descriptions_are_rejected() {
        assert!(Interface::new("NoDots").is_err());
        assert!(Method::new("Has.Dot", vec![]).is_err());
        assert!(Arg::new("ii", ArgDirection::In).is_err());
        assert!(Arg::new("a{", ArgDirection::In).is_err());
        assert!(Property::new("P", "ii", PropertyAccess::Read).is_err());
    }
}
