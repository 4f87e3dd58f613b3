use crate::error::{Error, ProtocolError, Result};
use crate::ledger::{FetchPlan, Ledger, PropertyObserver};
use crate::pending::{self, Pending};
use crate::protocol::{
    self, MemberKey, MethodReturn, PropertyChanged, ServerEnvelope, ViewModelDescriptor, VmId,
};
use crate::sink::{ErrorEvent, ErrorSink};
use crate::transport::{ConnectedHandler, ReceivedHandler};
use crate::view_model::{MethodTable, ViewModelRef};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// What a session needs from the connection underneath it.
pub trait Channel: Send + Sync + 'static {
    fn send(&self, message: Value) -> Result<()>;
    fn on_connected(&self, handler: ConnectedHandler);
    fn on_received(&self, handler: ReceivedHandler);
    fn is_connected(&self) -> bool;
    fn close(&self);
}

/// Receives view models the server sends without a matching fetch, such as
/// the root view model of a handshake.
pub type Frontend = Arc<dyn Fn(&Session, ViewModelRef) + Send + Sync>;

/// Clones share one session. View models and property handles only hold a
/// weak link back, so they fail with [`Error::Disconnected`] once the last
/// `Session` clone is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Clone)]
pub(crate) struct WeakSession(Weak<SessionInner>);

struct SessionInner {
    address: String,
    channel: Arc<dyn Channel>,
    ledger: Mutex<Ledger>,
    errors: ErrorSink,
    tables: Mutex<HashMap<String, Arc<MethodTable>>>,
    binding: Mutex<Binding>,
}

#[derive(Default)]
struct Binding {
    root: Option<VmId>,
    frontend: Option<Frontend>,
    /// The connect handler is registered once and reads `root` when it runs.
    handshake: bool,
}

impl WeakSession {
    pub fn upgrade(&self) -> Result<Session> {
        self.0
            .upgrade()
            .map(|inner| Session { inner })
            .ok_or(Error::Disconnected)
    }
}

impl Session {
    pub fn new(address: impl Into<String>, channel: Arc<dyn Channel>, errors: ErrorSink) -> Self {
        let session = Self {
            inner: Arc::new(SessionInner {
                address: address.into(),
                channel: Arc::clone(&channel),
                ledger: Mutex::new(Ledger::default()),
                errors,
                tables: Mutex::new(HashMap::new()),
                binding: Mutex::new(Binding::default()),
            }),
        };
        let weak = session.downgrade();
        channel.on_received(Arc::new(move |message: &Value| {
            if let Ok(session) = weak.upgrade() {
                session.receive(message);
            }
        }));
        session
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn errors(&self) -> &ErrorSink {
        &self.inner.errors
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn send_view_model_request(&self, id: &VmId) -> Result<()> {
        if id.is_empty() {
            return Err(Error::EmptyViewModelId);
        }
        let envelope = protocol::encode_client_envelope(&protocol::get_view_model_envelope(id))?;
        self.inner.channel.send(envelope)
    }

    /// Resolves `id` into a view model. A cached id answers immediately,
    /// an id with a request already in flight waits for that request.
    pub fn fetch_view_model_with(
        &self,
        id: &VmId,
        callback: impl FnOnce(Result<ViewModelRef>) + Send + 'static,
    ) -> Result<()> {
        if id.is_empty() {
            error!(address = %self.inner.address, "refusing to fetch a view model without an id");
            return Err(Error::EmptyViewModelId);
        }

        let plan = self.inner.ledger.lock().begin_fetch(id, Box::new(callback));
        match plan {
            FetchPlan::Ready(vm, callback) => callback(Ok(vm)),
            FetchPlan::Joined => debug!(vm_id = %id, "joining in-flight view model fetch"),
            FetchPlan::Send => {
                if let Err(err) = self.send_view_model_request(id) {
                    let waiters = self.inner.ledger.lock().abandon_fetch(id);
                    for waiter in waiters {
                        waiter(Err(Error::Disconnected));
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn fetch_view_model(&self, id: &VmId) -> Pending<ViewModelRef> {
        let (resolver, pending) = pending::channel();
        match self.fetch_view_model_with(id, move |result| resolver.resolve(result)) {
            Ok(()) => pending,
            Err(err) => Pending::ready(Err(err)),
        }
    }

    pub fn cached(&self, id: &VmId) -> Option<ViewModelRef> {
        self.inner.ledger.lock().cached(id)
    }

    /// Sends `call` and queues `callback` for the matching `callReturn`.
    pub fn call_with(
        &self,
        vm_id: &VmId,
        method: &str,
        args: Vec<Value>,
        callback: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> Result<()> {
        let envelope =
            protocol::encode_client_envelope(&protocol::call_envelope(vm_id, method, args))?;
        let key = MemberKey::new(vm_id, method);

        // Queue order has to match wire order for the key.
        let mut ledger = self.inner.ledger.lock();
        ledger.push_call(key.clone(), Box::new(callback));
        if let Err(err) = self.inner.channel.send(envelope) {
            ledger.retract_call(&key);
            return Err(err);
        }
        Ok(())
    }

    pub fn call(&self, vm_id: &VmId, method: &str, args: Vec<Value>) -> Pending<Value> {
        let (resolver, pending) = pending::channel();
        match self.call_with(vm_id, method, args, move |result| resolver.resolve(result)) {
            Ok(()) => pending,
            Err(err) => Pending::ready(Err(err)),
        }
    }

    pub fn set_property(&self, vm_id: &VmId, prop_name: &str, value: Value) -> Result<()> {
        let envelope = protocol::encode_client_envelope(&protocol::set_property_envelope(
            vm_id, prop_name, value,
        ))?;
        self.inner.channel.send(envelope)
    }

    /// Installs the observer for `key`, replacing any earlier one.
    pub fn observe(&self, key: MemberKey, observer: PropertyObserver) {
        if self.inner.ledger.lock().observe(key.clone(), observer).is_some() {
            debug!(%key, "replaced property observer");
        }
    }

    /// Binds the session to `id`: `getVM` is sent on every (re)connect and
    /// uncorrelated view models go to `frontend`. Binding the id that is
    /// already bound does nothing.
    pub fn connect_to_view_model(
        &self,
        id: &VmId,
        frontend: impl Fn(&Session, ViewModelRef) + Send + Sync + 'static,
    ) -> Result<()> {
        if id.is_empty() {
            return Err(Error::EmptyViewModelId);
        }
        let install = {
            let mut binding = self.inner.binding.lock();
            if binding.root.as_ref() == Some(id) {
                debug!(vm_id = %id, "already bound");
                return Ok(());
            }
            binding.root = Some(id.clone());
            binding.frontend = Some(Arc::new(frontend));
            !std::mem::replace(&mut binding.handshake, true)
        };
        info!(address = %self.inner.address, vm_id = %id, "binding root view model");

        if install {
            let weak = self.downgrade();
            self.inner.channel.on_connected(Arc::new(move || {
                if let Ok(session) = weak.upgrade() {
                    session.handshake();
                }
            }));
        } else if self.inner.channel.is_connected() {
            self.handshake();
        }
        Ok(())
    }

    fn handshake(&self) {
        let root = self.inner.binding.lock().root.clone();
        let Some(id) = root else {
            return;
        };
        if let Err(err) = self.send_view_model_request(&id) {
            warn!(vm_id = %id, error = %err, "handshake request failed");
        }
    }

    /// Binds `id` and resolves once with the first view model the handshake
    /// produces.
    pub fn root(&self, id: &VmId) -> Pending<ViewModelRef> {
        let (resolver, pending) = pending::channel();
        let resolver = Mutex::new(Some(resolver));
        let bound = self.connect_to_view_model(id, move |_, vm| {
            if let Some(resolver) = resolver.lock().take() {
                resolver.resolve(Ok(vm));
            }
        });
        match bound {
            Ok(()) => pending,
            Err(err) => Pending::ready(Err(err)),
        }
    }

    pub fn receive(&self, message: &Value) {
        let envelope = match protocol::decode_server_envelope(message.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(address = %self.inner.address, error = %err, "dropping inbound message");
                return;
            }
        };
        let kind = envelope.kind();
        if let Err(err) = self.dispatch(envelope) {
            error!(address = %self.inner.address, kind, error = %err, "protocol violation");
        }
    }

    pub fn dispatch(&self, envelope: ServerEnvelope) -> Result<(), ProtocolError> {
        match envelope {
            ServerEnvelope::ViewModel(descriptor) => {
                self.view_model_returned(descriptor);
                Ok(())
            }
            ServerEnvelope::PropertyChanged(changed) => {
                self.property_changed(changed);
                Ok(())
            }
            ServerEnvelope::MethodReturned(returned) => self.method_returned(returned),
            ServerEnvelope::Error(server_error) => {
                error!(
                    address = %self.inner.address,
                    error_type = %server_error.error_type,
                    message = %server_error.message,
                    "server reported an error"
                );
                self.inner.errors.report(ErrorEvent::Server(server_error));
                Ok(())
            }
        }
    }

    fn view_model_returned(&self, descriptor: ViewModelDescriptor) {
        let table = self.method_table(&descriptor);
        let vm = ViewModelRef::new(self.downgrade(), descriptor, table);
        let (vm, waiters) = self.inner.ledger.lock().complete_fetch(vm);

        if !waiters.is_empty() {
            for waiter in waiters {
                waiter(Ok(vm.clone()));
            }
            return;
        }
        let frontend = self.inner.binding.lock().frontend.clone();
        match frontend {
            Some(frontend) => frontend(self, vm),
            None => debug!(vm_id = %vm.id(), "view model arrived with nobody waiting"),
        }
    }

    fn property_changed(&self, changed: PropertyChanged) {
        let key = MemberKey::new(&changed.vm_id, changed.state.prop_name.clone());
        let observer = self.inner.ledger.lock().observer(&key);
        match observer {
            Some(observer) => observer(&changed.state),
            None => warn!(
                %key,
                "no observer for property push, could it be that the current view does not use this property?"
            ),
        }
    }

    fn method_returned(&self, returned: MethodReturn) -> Result<(), ProtocolError> {
        let key = MemberKey::new(&returned.vm_id, returned.name);
        let callback = self.inner.ledger.lock().pop_call(&key);
        match callback {
            Some(callback) => {
                callback(Ok(returned.returns));
                Ok(())
            }
            None => Err(ProtocolError::UnexpectedReturn {
                key: key.to_string(),
            }),
        }
    }

    fn method_table(&self, descriptor: &ViewModelDescriptor) -> Arc<MethodTable> {
        if descriptor.class_name.is_empty() {
            return Arc::new(MethodTable::from_descriptor(descriptor));
        }
        let mut tables = self.inner.tables.lock();
        Arc::clone(
            tables
                .entry(descriptor.class_name.clone())
                .or_insert_with(|| Arc::new(MethodTable::from_descriptor(descriptor))),
        )
    }

    #[cfg(test)]
    pub(crate) fn pending_calls(&self, key: &MemberKey) -> usize {
        self.inner.ledger.lock().pending_calls(key)
    }

    /// Drops every cache and fails everything still waiting, then closes the
    /// channel.
    pub fn close(&self) {
        let drained = self.inner.ledger.lock().drain();
        self.inner.tables.lock().clear();
        {
            let mut binding = self.inner.binding.lock();
            binding.root = None;
            binding.frontend = None;
        }
        self.inner.channel.close();

        for waiter in drained.fetches {
            waiter(Err(Error::Disconnected));
        }
        for callback in drained.calls {
            callback(Err(Error::Disconnected));
        }
        info!(address = %self.inner.address, "session closed");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.inner.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{recording_session, view_model_frame};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    const USER: &str = "app.UserViewModel-1";

    #[test]
    fn empty_ids_are_refused() {
        let (session, channel) = recording_session();

        assert!(matches!(
            session.send_view_model_request(&VmId::from("")),
            Err(Error::EmptyViewModelId)
        ));
        assert!(matches!(
            session.fetch_view_model(&VmId::from("  ")).wait(),
            Err(Error::EmptyViewModelId)
        ));
        assert!(channel.sent().is_empty());
    }

    #[test]
    fn concurrent_fetches_share_one_request() {
        let (session, channel) = recording_session();
        let id = VmId::from(USER);

        let first = session.fetch_view_model(&id);
        let second = session.fetch_view_model(&id);
        assert_eq!(channel.sent(), vec![json!({"EventType": "getVM", "vmId": USER})]);

        channel.deliver(view_model_frame(USER, "app.UserViewModel"));
        let first = first.wait_timeout(Duration::from_secs(1)).expect("first waiter");
        let second = second.wait_timeout(Duration::from_secs(1)).expect("second waiter");
        assert!(first.ptr_eq(&second));

        let third = session.fetch_view_model(&id).wait().expect("cache hit");
        assert!(third.ptr_eq(&first));
        assert_eq!(channel.sent().len(), 1, "cache hits stay off the wire");
    }

    #[test]
    fn redelivered_descriptor_keeps_the_cached_ref() {
        let (session, channel) = recording_session();
        let id = VmId::from(USER);
        let first = session.fetch_view_model(&id);
        channel.deliver(view_model_frame(USER, "app.UserViewModel"));
        let first = first.wait().expect("fetched");

        channel.deliver(view_model_frame(USER, "app.UserViewModel"));
        let cached = session.cached(&id).expect("still cached");
        assert!(cached.ptr_eq(&first));
    }

    #[test]
    fn method_tables_are_shared_per_class() {
        let (session, channel) = recording_session();
        let a = session.fetch_view_model(&VmId::from("app.UserViewModel-1"));
        let b = session.fetch_view_model(&VmId::from("app.UserViewModel-2"));
        channel.deliver(view_model_frame("app.UserViewModel-1", "app.UserViewModel"));
        channel.deliver(view_model_frame("app.UserViewModel-2", "app.UserViewModel"));

        let a = a.wait().expect("a");
        let b = b.wait().expect("b");
        assert!(!a.ptr_eq(&b));
        assert!(Arc::ptr_eq(a.method_table(), b.method_table()));
    }

    #[test]
    fn returns_are_matched_first_in_first_out() {
        let (session, channel) = recording_session();
        let id = VmId::from(USER);
        let first = session.call(&id, "greet", vec![json!("a")]);
        let second = session.call(&id, "greet", vec![json!("b")]);

        channel.deliver(json!({
            "EventType": "callReturn",
            "EventPayload": {"vmId": USER, "name": "greet", "returns": "hello a"}
        }));
        channel.deliver(json!({
            "EventType": "callReturn",
            "EventPayload": {"vmId": USER, "name": "greet", "returns": "hello b"}
        }));

        assert_eq!(first.wait().expect("first"), json!("hello a"));
        assert_eq!(second.wait().expect("second"), json!("hello b"));
    }

    #[test]
    #[traced_test]
    fn unexpected_return_is_a_logged_protocol_error() {
        let (session, channel) = recording_session();

        let err = session
            .dispatch(ServerEnvelope::MethodReturned(MethodReturn {
                vm_id: VmId::from(USER),
                name: "greet".to_string(),
                returns: json!(null),
            }))
            .expect_err("nothing pending");
        match err {
            ProtocolError::UnexpectedReturn { key } => assert_eq!(key, "app.UserViewModel-1:greet"),
            other => panic!("expected unexpected return, got {other:?}"),
        }

        channel.deliver(json!({
            "EventType": "callReturn",
            "EventPayload": {"vmId": USER, "name": "greet", "returns": 1}
        }));
        assert!(logs_contain("protocol violation"));
    }

    #[test]
    #[traced_test]
    fn unobserved_push_is_benign() {
        let (session, channel) = recording_session();
        let push = json!({
            "EventType": "show",
            "EventPayload": {"vmId": USER, "propName": "username", "value": "bob",
                             "type": {"name": "java.lang.String", "states": [], "viewable": false}}
        });

        channel.deliver(push.clone());
        channel.deliver(push);

        assert!(channel.sent().is_empty());
        assert!(session.cached(&VmId::from(USER)).is_none());
        assert!(logs_contain("could it be that the current view does not use this property"));
    }

    #[test]
    #[traced_test]
    fn undecodable_envelopes_are_dropped() {
        let (_session, channel) = recording_session();
        channel.deliver(json!({"EventType": "reload", "EventPayload": {}}));
        assert!(logs_contain("dropping inbound message"));
    }

    #[test]
    fn server_errors_reach_the_sink() {
        let (session, channel) = recording_session();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            session.errors().on_error(move |event| {
                assert!(matches!(event, ErrorEvent::Server(_)));
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        channel.deliver(json!({
            "EventType": "error",
            "EventPayload": {
                "message": "boom",
                "stackTrace": [],
                "type": "java.lang.RuntimeException"
            }
        }));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(session.errors().history().len(), 1);
    }

    #[test]
    fn handshake_runs_on_every_connect_and_binding_is_idempotent() {
        let (session, channel) = recording_session();
        let root = VmId::from("app.ContentViewModel-0");
        let arrivals = Arc::new(AtomicUsize::new(0));
        {
            let arrivals = Arc::clone(&arrivals);
            session
                .connect_to_view_model(&root, move |_, vm| {
                    assert_eq!(vm.class_name(), "app.ContentViewModel");
                    arrivals.fetch_add(1, Ordering::SeqCst);
                })
                .expect("bind");
        }
        session
            .connect_to_view_model(&root, |_, _| panic!("second frontend must not be installed"))
            .expect("rebind is a no-op");
        assert_eq!(channel.sent().len(), 1);

        channel.reconnect();
        assert_eq!(
            channel.sent(),
            vec![
                json!({"EventType": "getVM", "vmId": "app.ContentViewModel-0"}),
                json!({"EventType": "getVM", "vmId": "app.ContentViewModel-0"}),
            ]
        );

        channel.deliver(view_model_frame("app.ContentViewModel-0", "app.ContentViewModel"));
        assert_eq!(arrivals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rebinding_reuses_the_connect_handler() {
        let (session, channel) = recording_session();
        session
            .connect_to_view_model(&VmId::from("app.ContentViewModel-0"), |_, _| {})
            .expect("bind");
        session
            .connect_to_view_model(&VmId::from("app.AdminViewModel-0"), |_, _| {})
            .expect("rebind");
        assert_eq!(
            channel.sent(),
            vec![
                json!({"EventType": "getVM", "vmId": "app.ContentViewModel-0"}),
                json!({"EventType": "getVM", "vmId": "app.AdminViewModel-0"}),
            ]
        );
        assert_eq!(channel.connected_handlers(), 1);

        channel.clear();
        channel.reconnect();
        assert_eq!(
            channel.sent(),
            vec![json!({"EventType": "getVM", "vmId": "app.AdminViewModel-0"})]
        );
    }

    #[test]
    fn root_resolves_with_the_handshake_view_model() {
        let (session, channel) = recording_session();
        let pending = session.root(&VmId::from("app.ContentViewModel-0"));
        channel.deliver(view_model_frame("app.ContentViewModel-0", "app.ContentViewModel"));
        channel.deliver(view_model_frame("app.ContentViewModel-0", "app.ContentViewModel"));

        let vm = pending.wait_timeout(Duration::from_secs(1)).expect("root");
        assert_eq!(vm.id().as_str(), "app.ContentViewModel-0");
    }

    #[test]
    fn close_fails_everything_still_waiting() {
        let (session, channel) = recording_session();
        let fetch = session.fetch_view_model(&VmId::from(USER));
        let call = session.call(&VmId::from(USER), "greet", Vec::new());

        session.close();
        assert!(channel.is_closed());
        assert!(matches!(fetch.wait(), Err(Error::Disconnected)));
        assert!(matches!(call.wait(), Err(Error::Disconnected)));
        assert_eq!(session.pending_calls(&MemberKey::new(&VmId::from(USER), "greet")), 0);
    }
}
