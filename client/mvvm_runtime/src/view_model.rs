//! Proxies for server view models.
//!
//! A view model's surface is whatever its descriptor lists under `methods`.
//! Each method is dispatched by its declared return type: `void` methods are
//! invoked, `Var`/`Val` methods become property handles and everything else
//! becomes a one-shot getter.

use crate::error::{Error, Result};
use crate::pending::{self, Pending};
use crate::property::{PropertyCell, Val, Var};
use crate::protocol::{MethodDescriptor, PROP_VALUE, ReturnKind, ViewModelDescriptor, VmId};
use crate::session::{Session, WeakSession};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Method lookup for one view model class, shared by all its instances.
#[derive(Debug)]
pub struct MethodTable {
    class_name: String,
    methods: Vec<MethodDescriptor>,
    index: HashMap<String, usize>,
}

impl MethodTable {
    pub fn from_descriptor(descriptor: &ViewModelDescriptor) -> Self {
        let methods = descriptor.methods.clone();
        let index = methods
            .iter()
            .enumerate()
            .map(|(position, method)| (method.name.clone(), position))
            .collect();
        Self {
            class_name: descriptor.class_name.clone(),
            methods,
            index,
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn get(&self, name: &str) -> Option<&MethodDescriptor> {
        self.index.get(name).map(|position| &self.methods[*position])
    }
}

/// Result of [`ViewModelRef::member`].
#[derive(Debug)]
pub enum Member {
    /// A `void` method; the call has been sent.
    Invoked,
    Var(Var),
    Val(Val),
    Getter(Getter),
}

/// Handle to one resolved view model. Holds its session weakly: once the
/// last [`Session`] clone is dropped, every call through it fails with
/// [`Error::Disconnected`].
#[derive(Clone)]
pub struct ViewModelRef {
    inner: Arc<ViewModelInner>,
}

struct ViewModelInner {
    descriptor: ViewModelDescriptor,
    table: Arc<MethodTable>,
    session: WeakSession,
    cells: Mutex<HashMap<String, Arc<PropertyCell>>>,
}

impl ViewModelRef {
    pub(crate) fn new(
        session: WeakSession,
        descriptor: ViewModelDescriptor,
        table: Arc<MethodTable>,
    ) -> Self {
        Self {
            inner: Arc::new(ViewModelInner {
                descriptor,
                table,
                session,
                cells: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> &VmId {
        &self.inner.descriptor.vm_id
    }

    pub fn class_name(&self) -> &str {
        &self.inner.descriptor.class_name
    }

    pub fn descriptor(&self) -> &ViewModelDescriptor {
        &self.inner.descriptor
    }

    /// The descriptor payload as received.
    pub fn raw(&self) -> &Value {
        &self.inner.descriptor.raw
    }

    pub fn method_table(&self) -> &Arc<MethodTable> {
        &self.inner.table
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        self.inner.table.methods()
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.inner.table.get(name)
    }

    pub fn session(&self) -> Result<Session> {
        self.inner.session.upgrade()
    }

    pub fn ptr_eq(&self, other: &ViewModelRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Invokes `name` whether or not the descriptor declares it.
    pub fn invoke_with(
        &self,
        name: &str,
        args: Vec<Value>,
        callback: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> Result<()> {
        self.session()?.call_with(self.id(), name, args, callback)
    }

    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Pending<Value> {
        let (resolver, pending) = pending::channel();
        match self.invoke_with(name, args, move |result| resolver.resolve(result)) {
            Ok(()) => pending,
            Err(err) => Pending::ready(Err(err)),
        }
    }

    /// Fire-and-forget call of a `void` method.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<()> {
        self.expect_kind(name, &[ReturnKind::Void])?;
        self.invoke_with(name, args, |_| {})
    }

    pub fn member(&self, name: &str, args: Vec<Value>) -> Result<Member> {
        let kind = self.declared(name)?.returns.kind();
        if matches!(kind, ReturnKind::Var | ReturnKind::Val) && !args.is_empty() {
            return Err(Error::ParameterizedAccessor {
                method: name.to_string(),
                arity: args.len(),
            });
        }
        match kind {
            ReturnKind::Void => {
                self.invoke_with(name, args, |_| {})?;
                Ok(Member::Invoked)
            }
            ReturnKind::Var => Ok(Member::Var(Var::new(self.cell(name)))),
            ReturnKind::Val => Ok(Member::Val(Val::new(self.cell(name)))),
            ReturnKind::Value => Ok(Member::Getter(Getter::new(self, name, args))),
        }
    }

    /// Mutable handle for a `Var` method. Repeated calls return the same
    /// handle.
    pub fn var(&self, name: &str) -> Result<Var> {
        self.expect_kind(name, &[ReturnKind::Var])?;
        Ok(Var::new(self.cell(name)))
    }

    /// Read-only handle. On a `Var` method this views the same handle
    /// [`ViewModelRef::var`] returns.
    pub fn val(&self, name: &str) -> Result<Val> {
        self.expect_kind(name, &[ReturnKind::Val, ReturnKind::Var])?;
        Ok(Val::new(self.cell(name)))
    }

    pub fn getter(&self, name: &str, args: Vec<Value>) -> Result<Getter> {
        self.expect_kind(name, &[ReturnKind::Value])?;
        Ok(Getter::new(self, name, args))
    }

    fn declared(&self, name: &str) -> Result<&MethodDescriptor> {
        self.method(name).ok_or_else(|| Error::UnknownMethod {
            class: self.display_class().to_string(),
            method: name.to_string(),
        })
    }

    fn expect_kind(&self, name: &str, allowed: &[ReturnKind]) -> Result<()> {
        let found = self.declared(name)?.returns.kind();
        if allowed.contains(&found) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" or ");
        Err(Error::WrongReturnKind {
            method: name.to_string(),
            expected,
            found: found.to_string(),
        })
    }

    fn display_class(&self) -> &str {
        if self.class_name().is_empty() {
            self.id().as_str()
        } else {
            self.class_name()
        }
    }

    fn cell(&self, accessor: &str) -> Arc<PropertyCell> {
        let mut cells = self.inner.cells.lock();
        Arc::clone(cells.entry(accessor.to_string()).or_insert_with(|| {
            Arc::new(PropertyCell::new(
                self.inner.session.clone(),
                self.id().clone(),
                accessor,
            ))
        }))
    }
}

impl fmt::Debug for ViewModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewModelRef")
            .field("id", self.id())
            .field("class_name", &self.class_name())
            .field("methods", &self.methods().len())
            .finish()
    }
}

/// One-shot accessor for a method returning a plain value. Every `get` is a
/// full round trip.
#[derive(Clone)]
pub struct Getter {
    session: WeakSession,
    vm_id: VmId,
    method: String,
    args: Vec<Value>,
}

impl Getter {
    fn new(vm: &ViewModelRef, method: &str, args: Vec<Value>) -> Self {
        Self {
            session: vm.inner.session.clone(),
            vm_id: vm.id().clone(),
            method: method.to_string(),
            args,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn get(&self, callback: impl FnOnce(Result<Value>) + Send + 'static) -> Result<()> {
        self.session.upgrade()?.call_with(
            &self.vm_id,
            &self.method,
            self.args.clone(),
            move |result| callback(result.map(unwrap_return)),
        )
    }

    pub fn fetch(&self) -> Pending<Value> {
        let (resolver, pending) = pending::channel();
        match self.get(move |result| resolver.resolve(result)) {
            Ok(()) => pending,
            Err(err) => Pending::ready(Err(err)),
        }
    }
}

impl fmt::Debug for Getter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Getter")
            .field("vm_id", &self.vm_id)
            .field("method", &self.method)
            .field("args", &self.args)
            .finish()
    }
}

/// Plain-value returns may still arrive wrapped as `{value: ...}`.
pub(crate) fn unwrap_return(returns: Value) -> Value {
    match returns {
        Value::Object(mut object) if object.contains_key(PROP_VALUE) => {
            object.remove(PROP_VALUE).unwrap_or(Value::Null)
        }
        other => other,
    }
}
