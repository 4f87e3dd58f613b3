use crate::error::Result;
use crate::session::{Channel, Session};
use crate::sink::ErrorSink;
use crate::transport::{ConnectedHandler, ReceivedHandler};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const LOGIN_VM: &str = "app.LoginViewModel-0";

/// Channel that is always open, records what it sends and delivers inbound
/// messages synchronously on the calling thread.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<Value>>,
    connected: Mutex<Vec<ConnectedHandler>>,
    received: Mutex<Vec<ReceivedHandler>>,
    closed: AtomicBool,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn deliver(&self, message: Value) {
        let handlers = self.received.lock().clone();
        for handler in handlers {
            handler(&message);
        }
    }

    pub fn reconnect(&self) {
        let handlers = self.connected.lock().clone();
        for handler in handlers {
            handler();
        }
    }

    pub fn connected_handlers(&self) -> usize {
        self.connected.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Channel for RecordingChannel {
    fn send(&self, message: Value) -> Result<()> {
        self.sent.lock().push(message);
        Ok(())
    }

    fn on_connected(&self, handler: ConnectedHandler) {
        self.connected.lock().push(Arc::clone(&handler));
        handler();
    }

    fn on_received(&self, handler: ReceivedHandler) {
        self.received.lock().push(handler);
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn recording_session() -> (Session, Arc<RecordingChannel>) {
    let channel = Arc::new(RecordingChannel::default());
    let session = Session::new(
        "memory://session",
        Arc::clone(&channel) as Arc<dyn Channel>,
        ErrorSink::new(16),
    );
    (session, channel)
}

fn string_type() -> Value {
    json!({"name": "java.lang.String", "states": [], "viewable": false})
}

/// A `viewModel` frame with the login surface: two `Var`s, a `Val`, a
/// viewable `Val`, a `void` action and a parameterised getter.
pub fn view_model_frame(vm_id: &str, class_name: &str) -> Value {
    json!({
        "EventType": "viewModel",
        "EventPayload": {
            "vmId": vm_id,
            "className": class_name,
            "props": {
                "username": {"propName": "username", "value": "", "type": string_type()}
            },
            "methods": [
                {"name": "username", "args": [], "returns": {"type": "Var", "viewable": false}},
                {"name": "password", "args": [], "returns": {"type": "Var", "viewable": false}},
                {"name": "status", "args": [], "returns": {"type": "Val", "viewable": false}},
                {"name": "currentUser", "args": [], "returns": {"type": "Val", "viewable": true}},
                {"name": "login", "args": [], "returns": {"type": "void", "viewable": false}},
                {
                    "name": "greeting",
                    "args": [{"name": "lang", "type": "java.lang.String", "viewable": false}],
                    "returns": {"type": "java.lang.String", "viewable": false}
                }
            ]
        }
    })
}

pub fn login_frame() -> Value {
    view_model_frame(LOGIN_VM, "app.LoginViewModel")
}

/// `callReturn` for a property accessor whose property shares its name.
pub fn property_return(vm_id: &str, name: &str, value: Value) -> Value {
    json!({
        "EventType": "callReturn",
        "EventPayload": {
            "vmId": vm_id,
            "name": name,
            "returns": {"propName": name, "value": value, "type": string_type()}
        }
    })
}

pub fn property_show(vm_id: &str, prop_name: &str, value: Value) -> Value {
    json!({
        "EventType": "show",
        "EventPayload": {
            "vmId": vm_id,
            "propName": prop_name,
            "value": value,
            "type": string_type()
        }
    })
}
