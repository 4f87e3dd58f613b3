use crate::error::{Error, ProtocolError, Result};
use crate::pending::{self, Pending, Subscription};
use crate::protocol::{self, CALL_RETURN, MemberKey, PropertyState, PropertyType, VmId};
use crate::session::WeakSession;
use crate::view_model::ViewModelRef;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A property value after viewable ids have been resolved.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Value(Value),
    ViewModel(ViewModelRef),
}

impl PropertyValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PropertyValue::Value(value) => Some(value),
            PropertyValue::ViewModel(_) => None,
        }
    }

    pub fn as_view_model(&self) -> Option<&ViewModelRef> {
        match self {
            PropertyValue::ViewModel(vm) => Some(vm),
            PropertyValue::Value(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Value(Value::Null))
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyValue::Value(a), PropertyValue::Value(b)) => a == b,
            (PropertyValue::ViewModel(a), PropertyValue::ViewModel(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        PropertyValue::Value(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Never fetched.
    Unresolved,
    /// First fetch on the wire.
    Resolving,
    Cached,
}

type StateWaiter = Box<dyn FnOnce(Result<PropertyState>) + Send>;
/// Returns false to unsubscribe.
type Listener = Box<dyn FnMut(&PropertyValue) -> bool + Send>;

/// Shared state behind every handle for one accessor of one view model.
pub(crate) struct PropertyCell {
    session: WeakSession,
    vm_id: VmId,
    accessor: String,
    state: Mutex<CellState>,
}

#[derive(Default)]
struct CellState {
    in_flight: bool,
    last: Option<PropertyState>,
    value: Option<PropertyValue>,
    waiters: Vec<StateWaiter>,
    listeners: Vec<Listener>,
    observing: bool,
}

impl CellState {
    fn phase(&self) -> Phase {
        match (&self.last, self.in_flight) {
            (Some(_), _) => Phase::Cached,
            (None, true) => Phase::Resolving,
            (None, false) => Phase::Unresolved,
        }
    }

    fn record(&mut self, state: PropertyState) {
        let unchanged = self
            .last
            .as_ref()
            .is_some_and(|last| last.value == state.value);
        if !state.prop_type.viewable {
            self.value = Some(PropertyValue::Value(state.value.clone()));
        } else if !unchanged {
            self.value = None;
        }
        self.last = Some(state);
    }
}

impl PropertyCell {
    pub fn new(session: WeakSession, vm_id: VmId, accessor: &str) -> Self {
        Self {
            session,
            vm_id,
            accessor: accessor.to_string(),
            state: Mutex::new(CellState::default()),
        }
    }

    /// Invokes the accessor, joining a request that is already in flight.
    fn refresh(self: &Arc<Self>, waiter: StateWaiter) {
        let start = {
            let mut state = self.state.lock();
            state.waiters.push(waiter);
            !std::mem::replace(&mut state.in_flight, true)
        };
        if !start {
            return;
        }

        let cell = Arc::clone(self);
        let sent = self.session.upgrade().and_then(|session| {
            session.call_with(&self.vm_id, &self.accessor, Vec::new(), move |result| {
                cell.finish_refresh(result)
            })
        });
        if let Err(err) = sent {
            self.finish_refresh(Err(err));
        }
    }

    fn finish_refresh(&self, result: Result<Value>) {
        let parsed = result.and_then(|returns| {
            protocol::from_payload::<PropertyState>(CALL_RETURN, returns).map_err(Error::from)
        });
        let waiters = {
            let mut state = self.state.lock();
            state.in_flight = false;
            if let Ok(fetched) = &parsed {
                state.record(fetched.clone());
            }
            std::mem::take(&mut state.waiters)
        };

        match parsed {
            Ok(fetched) => {
                for waiter in waiters {
                    waiter(Ok(fetched.clone()));
                }
            }
            Err(err) => {
                warn!(
                    vm_id = %self.vm_id,
                    accessor = %self.accessor,
                    error = %err,
                    "property fetch failed"
                );
                for waiter in waiters {
                    waiter(Err(self.failure(&err)));
                }
            }
        }
    }

    fn failure(&self, err: &Error) -> Error {
        match err {
            Error::Disconnected => Error::Disconnected,
            Error::Timeout => Error::Timeout,
            _ => Error::Unresolved {
                accessor: self.accessor.clone(),
            },
        }
    }

    /// Like `refresh`, but answers from the last known state when there is one.
    fn resolve(self: &Arc<Self>, waiter: StateWaiter) {
        let known = self.state.lock().last.clone();
        match known {
            Some(state) => waiter(Ok(state)),
            None => self.refresh(waiter),
        }
    }

    fn resolve_value(
        self: &Arc<Self>,
        state: PropertyState,
        callback: impl FnOnce(Result<PropertyValue>) + Send + 'static,
    ) {
        if !state.prop_type.viewable {
            return callback(Ok(PropertyValue::Value(state.value)));
        }
        let id = match state.value {
            Value::Null => return callback(Ok(PropertyValue::Value(Value::Null))),
            Value::String(id) if id.trim().is_empty() => {
                return callback(Ok(PropertyValue::Value(Value::Null)));
            }
            Value::String(id) => id,
            other => return callback(Err(ProtocolError::InvalidViewModelId(other).into())),
        };

        let session = match self.session.upgrade() {
            Ok(session) => session,
            Err(err) => return callback(Err(err)),
        };
        let cell = Arc::clone(self);
        let raw = Value::String(id.clone());
        let fetched = session.fetch_view_model_with(&VmId::from(id), move |result| {
            let result = result.map(PropertyValue::ViewModel);
            if let Ok(value) = &result {
                cell.store_resolved(&raw, value);
            }
            callback(result);
        });
        if let Err(err) = fetched {
            debug!(accessor = %self.accessor, error = %err, "viewable fetch not sent");
        }
    }

    fn store_resolved(&self, raw: &Value, value: &PropertyValue) {
        let mut state = self.state.lock();
        if state.last.as_ref().is_some_and(|last| &last.value == raw) {
            state.value = Some(value.clone());
        }
    }

    fn get_once(self: &Arc<Self>, callback: impl FnOnce(Result<PropertyValue>) + Send + 'static) {
        let cell = Arc::clone(self);
        self.refresh(Box::new(move |result: Result<PropertyState>| match result {
            Ok(state) => cell.resolve_value(state, callback),
            Err(err) => callback(Err(err)),
        }));
    }

    fn add_listener(self: &Arc<Self>, listener: Listener) {
        self.state.lock().listeners.push(listener);
        self.observe();
    }

    /// Registers this cell as the push observer for its property, once.
    fn observe(self: &Arc<Self>) {
        if std::mem::replace(&mut self.state.lock().observing, true) {
            return;
        }
        let cell = Arc::clone(self);
        self.resolve(Box::new(move |result: Result<PropertyState>| {
            let registered = result.and_then(|state| {
                let session = cell.session.upgrade()?;
                let weak = Arc::downgrade(&cell);
                session.observe(
                    MemberKey::new(&cell.vm_id, state.prop_name),
                    Arc::new(move |pushed: &PropertyState| {
                        if let Some(cell) = weak.upgrade() {
                            cell.on_push(pushed);
                        }
                    }),
                );
                Ok(())
            });
            if let Err(err) = registered {
                warn!(accessor = %cell.accessor, error = %err, "cannot observe property");
                cell.state.lock().observing = false;
            }
        }));
    }

    fn on_push(self: &Arc<Self>, pushed: &PropertyState) {
        self.state.lock().record(pushed.clone());
        let cell = Arc::clone(self);
        self.resolve_value(pushed.clone(), move |result| match result {
            Ok(value) => cell.notify(&value),
            Err(err) => warn!(accessor = %cell.accessor, error = %err, "dropping property push"),
        });
    }

    fn notify(&self, value: &PropertyValue) {
        let mut listeners = std::mem::take(&mut self.state.lock().listeners);
        listeners.retain_mut(|listener| listener(value));

        let mut state = self.state.lock();
        listeners.append(&mut state.listeners);
        state.listeners = listeners;
    }

    /// Current value first, then every push.
    ///
    /// The snapshot is taken and the listener registered under one state
    /// lock. The listener's own lock is held until the snapshot is delivered,
    /// so a push racing in from the I/O thread queues behind it.
    fn watch(self: &Arc<Self>, listener: Listener) {
        let listener = Arc::new(Mutex::new(listener));
        let forward = Arc::clone(&listener);
        let forward: Listener = Box::new(move |value: &PropertyValue| {
            let mut deliver = forward.lock();
            (*deliver)(value)
        });

        let mut state = self.state.lock();
        let snapshot = state.value.clone();
        let Some(value) = snapshot else {
            state.listeners.push(forward);
            drop(state);
            self.observe();
            let first = Arc::clone(&listener);
            self.get_once(move |result| match result {
                Ok(value) => {
                    let mut deliver = first.lock();
                    (*deliver)(&value);
                }
                Err(err) => debug!(error = %err, "initial property value unavailable"),
            });
            return;
        };
        let mut deliver = listener.lock();
        state.listeners.push(forward);
        drop(state);
        (*deliver)(&value);
        drop(deliver);
        self.observe();
    }

    fn cached(&self) -> Option<PropertyValue> {
        self.state.lock().value.clone()
    }
}

/// Read-only property handle.
#[derive(Clone)]
pub struct Val {
    cell: Arc<PropertyCell>,
}

impl Val {
    pub(crate) fn new(cell: Arc<PropertyCell>) -> Self {
        Self { cell }
    }

    pub fn vm_id(&self) -> &VmId {
        &self.cell.vm_id
    }

    pub fn accessor(&self) -> &str {
        &self.cell.accessor
    }

    /// Server-side property name, once known.
    pub fn property_name(&self) -> Option<String> {
        self.cell
            .state
            .lock()
            .last
            .as_ref()
            .map(|state| state.prop_name.clone())
    }

    pub fn phase(&self) -> Phase {
        self.cell.state.lock().phase()
    }

    pub fn cached(&self) -> Option<PropertyValue> {
        self.cell.cached()
    }

    /// Fetches the value from the server once.
    pub fn get_once(&self, callback: impl FnOnce(Result<PropertyValue>) + Send + 'static) {
        self.cell.get_once(callback);
    }

    pub fn load(&self) -> Pending<PropertyValue> {
        let (resolver, pending) = pending::channel();
        self.cell.get_once(move |result| resolver.resolve(result));
        pending
    }

    pub fn on_show(&self, mut callback: impl FnMut(&PropertyValue) + Send + 'static) {
        self.cell.add_listener(Box::new(move |value: &PropertyValue| {
            callback(value);
            true
        }));
    }

    pub fn updates(&self) -> Subscription<PropertyValue> {
        let (tx, subscription) = pending::stream();
        self.cell
            .add_listener(Box::new(move |value: &PropertyValue| tx.send(value.clone()).is_ok()));
        subscription
    }

    pub fn get(&self, mut callback: impl FnMut(&PropertyValue) + Send + 'static) {
        self.cell.watch(Box::new(move |value: &PropertyValue| {
            callback(value);
            true
        }));
    }

    pub fn watch(&self) -> Subscription<PropertyValue> {
        let (tx, subscription) = pending::stream();
        self.cell
            .watch(Box::new(move |value: &PropertyValue| tx.send(value.clone()).is_ok()));
        subscription
    }

    pub fn type_info(&self, callback: impl FnOnce(Result<PropertyType>) + Send + 'static) {
        self.cell.resolve(Box::new(move |result: Result<PropertyState>| {
            callback(result.map(|state| state.prop_type))
        }));
    }

    pub fn property_type(&self) -> Pending<PropertyType> {
        let (resolver, pending) = pending::channel();
        self.type_info(move |result| resolver.resolve(result));
        pending
    }

    pub fn ptr_eq(&self, other: &Val) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Val")
            .field("vm_id", &self.cell.vm_id)
            .field("accessor", &self.cell.accessor)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Mutable property handle.
#[derive(Clone)]
pub struct Var {
    val: Val,
}

impl Var {
    pub(crate) fn new(cell: Arc<PropertyCell>) -> Self {
        Self { val: Val::new(cell) }
    }

    pub fn as_val(&self) -> Val {
        self.val.clone()
    }

    pub fn vm_id(&self) -> &VmId {
        self.val.vm_id()
    }

    pub fn accessor(&self) -> &str {
        self.val.accessor()
    }

    pub fn property_name(&self) -> Option<String> {
        self.val.property_name()
    }

    pub fn phase(&self) -> Phase {
        self.val.phase()
    }

    pub fn cached(&self) -> Option<PropertyValue> {
        self.val.cached()
    }

    pub fn get_once(&self, callback: impl FnOnce(Result<PropertyValue>) + Send + 'static) {
        self.val.get_once(callback);
    }

    pub fn load(&self) -> Pending<PropertyValue> {
        self.val.load()
    }

    pub fn on_show(&self, callback: impl FnMut(&PropertyValue) + Send + 'static) {
        self.val.on_show(callback);
    }

    pub fn updates(&self) -> Subscription<PropertyValue> {
        self.val.updates()
    }

    pub fn get(&self, callback: impl FnMut(&PropertyValue) + Send + 'static) {
        self.val.get(callback);
    }

    pub fn watch(&self) -> Subscription<PropertyValue> {
        self.val.watch()
    }

    pub fn type_info(&self, callback: impl FnOnce(Result<PropertyType>) + Send + 'static) {
        self.val.type_info(callback);
    }

    pub fn property_type(&self) -> Pending<PropertyType> {
        self.val.property_type()
    }

    /// Sends one `act` once the property name is known. The local value is
    /// only updated by the server's push.
    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        let cell = Arc::clone(&self.val.cell);
        self.val.cell.resolve(Box::new(move |result: Result<PropertyState>| {
            let sent = result.and_then(|state| {
                cell.session
                    .upgrade()?
                    .set_property(&cell.vm_id, &state.prop_name, value)
            });
            if let Err(err) = sent {
                warn!(
                    vm_id = %cell.vm_id,
                    accessor = %cell.accessor,
                    error = %err,
                    "property update not sent"
                );
            }
        }));
    }

    pub fn ptr_eq(&self, other: &Var) -> bool {
        self.val.ptr_eq(&other.val)
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("vm_id", self.vm_id())
            .field("accessor", &self.accessor())
            .field("phase", &self.phase())
            .finish()
    }
}
