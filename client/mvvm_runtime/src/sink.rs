use crate::protocol::{ServerError, VmId};
use crate::view_model::ViewModelRef;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorEvent {
    Server(ServerError),
    /// The view layer could not find a renderer for a view model's class.
    UnrecognizedViewModel { vm_id: VmId, class_name: String },
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorEvent::Server(error) => write!(f, "server error: {error}"),
            ErrorEvent::UnrecognizedViewModel { vm_id, class_name } => {
                write!(f, "no view for {class_name} ({vm_id})")
            }
        }
    }
}

pub type ErrorListener = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;

/// Process-wide error fan-out shared by every session of a registry.
#[derive(Clone)]
pub struct ErrorSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    capacity: usize,
    listeners: Mutex<Vec<ErrorListener>>,
    history: Mutex<VecDeque<ErrorEvent>>,
}

impl ErrorSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                capacity: capacity.max(1),
                listeners: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn on_error(&self, listener: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        self.inner.listeners.lock().push(Arc::new(listener));
    }

    pub fn report(&self, event: ErrorEvent) {
        {
            let mut history = self.inner.history.lock();
            if history.len() == self.inner.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let listeners = self.inner.listeners.lock().clone();
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn report_unrecognized(&self, vm: &ViewModelRef) {
        self.report(ErrorEvent::UnrecognizedViewModel {
            vm_id: vm.id().clone(),
            class_name: vm.class_name().to_string(),
        });
    }

    /// Most recent events, oldest first.
    pub fn history(&self) -> Vec<ErrorEvent> {
        self.inner.history.lock().iter().cloned().collect()
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_ERROR_HISTORY)
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink")
            .field("capacity", &self.inner.capacity)
            .field("listeners", &self.inner.listeners.lock().len())
            .finish()
    }
}
