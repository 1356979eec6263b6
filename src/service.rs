use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{DBusError, Result};
use crate::introspect::{self, Arg, ArgDirection, PropertyAccess};
use crate::signature::SignatureTree;
use crate::validators;
use crate::value::Value;

/// The outcome of a method handler: the ordered output values, or an error
/// that is sent back to the caller as an `ERROR` reply.
pub type MethodResult = std::result::Result<Vec<Value>, DBusError>;

/// The boxed future a method handler returns.
pub type MethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send + 'static>>;

/// The boxed future a property setter returns.
pub type SetPropertyFuture = Pin<Box<dyn Future<Output = std::result::Result<(), DBusError>> + Send + 'static>>;

type MethodHandler = Box<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;
type PropertyGetter = Box<dyn Fn() -> std::result::Result<Value, DBusError> + Send + Sync>;
type PropertySetter = Box<dyn Fn(Value) -> SetPropertyFuture + Send + Sync>;

pub(crate) struct MethodDescriptor {
    pub(crate) name: String,
    pub(crate) in_signature: Arc<SignatureTree>,
    pub(crate) out_signature: Arc<SignatureTree>,
    pub(crate) handler: MethodHandler,
    pub(crate) disabled: bool,
}

pub(crate) struct PropertyDescriptor {
    pub(crate) name: String,
    pub(crate) signature: Arc<SignatureTree>,
    pub(crate) access: PropertyAccess,
    pub(crate) getter: Option<PropertyGetter>,
    pub(crate) setter: Option<PropertySetter>,
    pub(crate) disabled: bool,
}

pub(crate) struct SignalDescriptor {
    pub(crate) name: String,
    pub(crate) signature: Arc<SignatureTree>,
    pub(crate) disabled: bool,
}

/// An interface that can be exported on a bus to serve incoming calls.
///
/// Members are registered on a [`ServiceInterfaceBuilder`]; once built the
/// interface is immutable and can be exported at any number of paths on any
/// number of buses, shared through an [`Arc`].
///
/// # Examples
///
/// ```
/// use minibus::ServiceInterface;
///
/// let interface = ServiceInterface::builder("com.example.Echo")?
///     .method("Echo", "s", "s", |args| async move { Ok(args) })?
///     .signal("Echoed", "s")?
///     .build();
///
/// assert_eq!(interface.name(), "com.example.Echo");
/// # Ok::<_, minibus::Error>(())
/// ```
pub struct ServiceInterface {
    name: String,
    pub(crate) methods: Vec<MethodDescriptor>,
    pub(crate) properties: Vec<PropertyDescriptor>,
    pub(crate) signals: Vec<SignalDescriptor>,
}

impl ServiceInterface {
    /// Start building an interface with the given name.
    pub fn builder(name: &str) -> Result<ServiceInterfaceBuilder> {
        validators::assert_interface_name_valid(name)?;

        Ok(ServiceInterfaceBuilder {
            inner: ServiceInterface {
                name: name.into(),
                methods: Vec::new(),
                properties: Vec::new(),
                signals: Vec::new(),
            },
            last: LastMember::None,
        })
    }

    /// The name of the interface.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an enabled method by name and input signature.
    pub(crate) fn find_method(&self, name: &str, in_signature: &str) -> Option<&MethodDescriptor> {
        self.methods
            .iter()
            .find(|m| !m.disabled && m.name == name && m.in_signature.signature() == in_signature)
    }

    /// Look up an enabled method by name alone.
    pub(crate) fn find_method_named(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| !m.disabled && m.name == name)
    }

    /// Look up an enabled property by name.
    pub(crate) fn find_property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties
            .iter()
            .find(|p| !p.disabled && p.name == name)
    }

    /// Look up a signal by name, disabled or not.
    pub(crate) fn find_signal(&self, name: &str) -> Option<&SignalDescriptor> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// The introspection description of this interface, omitting disabled
    /// members.
    pub fn introspect(&self) -> introspect::Interface {
        let mut interface = introspect::Interface::new(&self.name)
            .expect("interface name was validated at build time");

        for method in self.methods.iter().filter(|m| !m.disabled) {
            let mut args = Vec::new();

            for ty in method.in_signature.types() {
                args.push(
                    Arg::new(&ty.signature(), ArgDirection::In)
                        .expect("signature was validated at build time"),
                );
            }

            for ty in method.out_signature.types() {
                args.push(
                    Arg::new(&ty.signature(), ArgDirection::Out)
                        .expect("signature was validated at build time"),
                );
            }

            interface = interface.with_method(
                introspect::Method::new(&method.name, args)
                    .expect("member name was validated at build time"),
            );
        }

        for signal in self.signals.iter().filter(|s| !s.disabled) {
            let args = signal
                .signature
                .types()
                .iter()
                .map(|ty| {
                    Arg::new(&ty.signature(), ArgDirection::Out)
                        .expect("signature was validated at build time")
                })
                .collect();

            interface = interface.with_signal(
                introspect::Signal::new(&signal.name, args)
                    .expect("member name was validated at build time"),
            );
        }

        for property in self.properties.iter().filter(|p| !p.disabled) {
            interface = interface.with_property(
                introspect::Property::new(
                    &property.name,
                    property.signature.signature(),
                    property.access,
                )
                .expect("property was validated at build time"),
            );
        }

        interface
    }
}

/// Builder collecting the member descriptors of a [`ServiceInterface`].
pub struct ServiceInterfaceBuilder {
    inner: ServiceInterface,
    last: LastMember,
}

#[derive(Clone, Copy)]
enum LastMember {
    None,
    Method,
    Property,
    Signal,
}

impl ServiceInterfaceBuilder {
    /// Register a method with the given input and output signatures.
    ///
    /// The handler receives the call's body values, already checked against
    /// the input signature, and returns the output values which are checked
    /// against the output signature before the reply is sent.
    pub fn method<F, Fut>(
        mut self,
        name: &str,
        in_signature: &str,
        out_signature: &str,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        validators::assert_member_name_valid(name)?;

        self.inner.methods.push(MethodDescriptor {
            name: name.into(),
            in_signature: SignatureTree::get(in_signature)?,
            out_signature: SignatureTree::get(out_signature)?,
            handler: Box::new(move |args| Box::pin(handler(args))),
            disabled: false,
        });

        self.last = LastMember::Method;
        Ok(self)
    }

    /// Register a read-only property backed by the given getter.
    pub fn property<G>(
        self,
        name: &str,
        signature: &str,
        getter: G,
    ) -> Result<Self>
    where
        G: Fn() -> std::result::Result<Value, DBusError> + Send + Sync + 'static,
    {
        self.property_full(
            name,
            signature,
            PropertyAccess::Read,
            Some(Box::new(getter) as PropertyGetter),
            None,
        )
    }

    /// Register a read-write property backed by a getter and a setter.
    ///
    /// The setter returns a future so that implementations that need to
    /// perform I/O before acknowledging the write can be awaited.
    pub fn writable_property<G, S, Fut>(
        self,
        name: &str,
        signature: &str,
        getter: G,
        setter: S,
    ) -> Result<Self>
    where
        G: Fn() -> std::result::Result<Value, DBusError> + Send + Sync + 'static,
        S: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), DBusError>> + Send + 'static,
    {
        self.property_full(
            name,
            signature,
            PropertyAccess::ReadWrite,
            Some(Box::new(getter) as PropertyGetter),
            Some(Box::new(move |value| Box::pin(setter(value)) as SetPropertyFuture)),
        )
    }

    /// Register a write-only property backed by the given setter.
    pub fn write_only_property<S, Fut>(self, name: &str, signature: &str, setter: S) -> Result<Self>
    where
        S: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), DBusError>> + Send + 'static,
    {
        self.property_full(
            name,
            signature,
            PropertyAccess::Write,
            None,
            Some(Box::new(move |value| Box::pin(setter(value)) as SetPropertyFuture)),
        )
    }

    fn property_full(
        mut self,
        name: &str,
        signature: &str,
        access: PropertyAccess,
        getter: Option<PropertyGetter>,
        setter: Option<PropertySetter>,
    ) -> Result<Self> {
        validators::assert_member_name_valid(name)?;

        let tree = SignatureTree::get(signature)?;

        if tree.types().len() != 1 {
            return Err(crate::Error::new(crate::error::ErrorKind::InvalidIntrospection(
                format!("property signature `{signature}` must be a single complete type").into(),
            )));
        }

        self.inner.properties.push(PropertyDescriptor {
            name: name.into(),
            signature: tree,
            access,
            getter,
            setter,
            disabled: false,
        });

        self.last = LastMember::Property;
        Ok(self)
    }

    /// Register a signal with the given body signature.
    ///
    /// Signals are emitted through [`MessageBus::emit_signal`].
    ///
    /// [`MessageBus::emit_signal`]: crate::MessageBus::emit_signal
    pub fn signal(mut self, name: &str, signature: &str) -> Result<Self> {
        validators::assert_member_name_valid(name)?;

        self.inner.signals.push(SignalDescriptor {
            name: name.into(),
            signature: SignatureTree::get(signature)?,
            disabled: false,
        });

        self.last = LastMember::Signal;
        Ok(self)
    }

    /// Mark the most recently added member as disabled.
    ///
    /// Disabled members are invisible to introspection and dispatch, which
    /// is useful for members that exist conditionally. Emitting a disabled
    /// signal fails with [`ErrorKind::SignalDisabled`].
    ///
    /// [`ErrorKind::SignalDisabled`]: crate::Error
    pub fn disabled(mut self) -> Self {
        match self.last {
            LastMember::Method => {
                if let Some(method) = self.inner.methods.last_mut() {
                    method.disabled = true;
                }
            }
            LastMember::Property => {
                if let Some(property) = self.inner.properties.last_mut() {
                    property.disabled = true;
                }
            }
            LastMember::Signal => {
                if let Some(signal) = self.inner.signals.last_mut() {
                    signal.disabled = true;
                }
            }
            LastMember::None => {}
        }

        self
    }

    /// Finish the interface.
    pub fn build(self) -> Arc<ServiceInterface> {
        Arc::new(self.inner)
    }
}
