use crate::error::Result;
use crate::protocol::{MemberKey, PropertyState, VmId};
use crate::view_model::ViewModelRef;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub type FetchCallback = Box<dyn FnOnce(Result<ViewModelRef>) + Send>;
pub type ReturnCallback = Box<dyn FnOnce(Result<Value>) + Send>;
pub type PropertyObserver = Arc<dyn Fn(&PropertyState) + Send + Sync>;

pub(crate) enum FetchPlan {
    /// Cache hit. The callback has not run yet.
    Ready(ViewModelRef, FetchCallback),
    /// A request for the same id is already on the wire.
    Joined,
    /// First waiter for this id; the caller sends `getVM`.
    Send,
}

/// Everything the session is still waiting for, plus the resolved cache.
#[derive(Default)]
pub(crate) struct Ledger {
    resolved: HashMap<VmId, ViewModelRef>,
    fetches: HashMap<VmId, Vec<FetchCallback>>,
    calls: HashMap<MemberKey, VecDeque<ReturnCallback>>,
    observers: HashMap<MemberKey, PropertyObserver>,
}

pub(crate) struct Drained {
    pub fetches: Vec<FetchCallback>,
    pub calls: Vec<ReturnCallback>,
}

impl Ledger {
    pub fn cached(&self, id: &VmId) -> Option<ViewModelRef> {
        self.resolved.get(id).cloned()
    }

    pub fn begin_fetch(&mut self, id: &VmId, callback: FetchCallback) -> FetchPlan {
        if let Some(vm) = self.resolved.get(id) {
            return FetchPlan::Ready(vm.clone(), callback);
        }
        match self.fetches.get_mut(id) {
            Some(waiters) => {
                waiters.push(callback);
                FetchPlan::Joined
            }
            None => {
                self.fetches.insert(id.clone(), vec![callback]);
                FetchPlan::Send
            }
        }
    }

    /// Caches `vm` unless its id is already resolved, in which case the
    /// existing ref wins. Returns the cached ref and the waiters to fulfil.
    pub fn complete_fetch(&mut self, vm: ViewModelRef) -> (ViewModelRef, Vec<FetchCallback>) {
        let waiters = self.fetches.remove(vm.id()).unwrap_or_default();
        let cached = self
            .resolved
            .entry(vm.id().clone())
            .or_insert(vm)
            .clone();
        (cached, waiters)
    }

    pub fn abandon_fetch(&mut self, id: &VmId) -> Vec<FetchCallback> {
        self.fetches.remove(id).unwrap_or_default()
    }

    #[cfg(test)]
    pub fn is_fetching(&self, id: &VmId) -> bool {
        self.fetches.contains_key(id)
    }

    pub fn push_call(&mut self, key: MemberKey, callback: ReturnCallback) {
        self.calls.entry(key).or_default().push_back(callback);
    }

    pub fn pop_call(&mut self, key: &MemberKey) -> Option<ReturnCallback> {
        let queue = self.calls.get_mut(key)?;
        let callback = queue.pop_front();
        if queue.is_empty() {
            self.calls.remove(key);
        }
        callback
    }

    /// Undoes the most recent `push_call` for `key`.
    pub fn retract_call(&mut self, key: &MemberKey) -> Option<ReturnCallback> {
        let queue = self.calls.get_mut(key)?;
        let callback = queue.pop_back();
        if queue.is_empty() {
            self.calls.remove(key);
        }
        callback
    }

    #[cfg(test)]
    pub fn pending_calls(&self, key: &MemberKey) -> usize {
        self.calls.get(key).map_or(0, VecDeque::len)
    }

    pub fn observe(
        &mut self,
        key: MemberKey,
        observer: PropertyObserver,
    ) -> Option<PropertyObserver> {
        self.observers.insert(key, observer)
    }

    pub fn observer(&self, key: &MemberKey) -> Option<PropertyObserver> {
        self.observers.get(key).cloned()
    }

    pub fn drain(&mut self) -> Drained {
        self.resolved.clear();
        self.observers.clear();
        Drained {
            fetches: self.fetches.drain().flat_map(|(_, waiters)| waiters).collect(),
            calls: self.calls.drain().flat_map(|(_, queue)| queue).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::test_support::{recording_session, view_model_frame};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(member: &str) -> MemberKey {
        MemberKey::new(&VmId::from("app.LoginViewModel-0"), member)
    }

    fn tagged(log: &Arc<parking_lot::Mutex<Vec<String>>>, tag: &str) -> ReturnCallback {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        Box::new(move |result: Result<Value>| {
            let value = result.expect("return value");
            log.lock().push(format!("{tag}={value}"));
        })
    }

    #[test]
    fn second_fetch_joins_the_first() {
        let mut ledger = Ledger::default();
        let id = VmId::from("app.UserViewModel-1");

        assert!(matches!(ledger.begin_fetch(&id, Box::new(|_| {})), FetchPlan::Send));
        assert!(matches!(ledger.begin_fetch(&id, Box::new(|_| {})), FetchPlan::Joined));
        assert!(ledger.is_fetching(&id));
        assert_eq!(ledger.abandon_fetch(&id).len(), 2);
        assert!(!ledger.is_fetching(&id));
    }

    #[test]
    fn completed_fetch_is_served_from_cache() {
        let (session, channel) = recording_session();
        channel.deliver(view_model_frame("app.UserViewModel-1", "app.UserViewModel"));
        let vm = session
            .cached(&VmId::from("app.UserViewModel-1"))
            .expect("delivered view model is cached");

        let mut ledger = Ledger::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let (cached, waiters) = ledger.complete_fetch(vm.clone());
        assert!(waiters.is_empty());
        assert!(cached.ptr_eq(&vm));

        let counter = Arc::clone(&hits);
        match ledger.begin_fetch(
            vm.id(),
            Box::new(move |result: Result<ViewModelRef>| {
                assert!(result.is_ok());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ) {
            FetchPlan::Ready(hit, callback) => {
                assert!(hit.ptr_eq(&vm));
                callback(Ok(hit));
            }
            _ => panic!("expected a cache hit"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn calls_are_answered_oldest_first_per_key() {
        let mut ledger = Ledger::default();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        ledger.push_call(key("login"), tagged(&log, "first"));
        ledger.push_call(key("username"), tagged(&log, "other"));
        ledger.push_call(key("login"), tagged(&log, "second"));
        assert_eq!(ledger.pending_calls(&key("login")), 2);

        ledger.pop_call(&key("login")).expect("first")(Ok(json!(1)));
        ledger.pop_call(&key("login")).expect("second")(Ok(json!(2)));
        assert!(ledger.pop_call(&key("login")).is_none());
        assert_eq!(ledger.pending_calls(&key("username")), 1);

        assert_eq!(*log.lock(), vec!["first=1".to_string(), "second=2".to_string()]);
    }

    #[test]
    fn retract_removes_the_newest_call() {
        let mut ledger = Ledger::default();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        ledger.push_call(key("login"), tagged(&log, "kept"));
        ledger.push_call(key("login"), tagged(&log, "retracted"));

        assert!(ledger.retract_call(&key("login")).is_some());
        ledger.pop_call(&key("login")).expect("kept")(Ok(json!(true)));
        assert_eq!(*log.lock(), vec!["kept=true".to_string()]);
    }

    #[test]
    fn observers_replace_each_other() {
        let mut ledger = Ledger::default();
        let first: PropertyObserver = Arc::new(|_| {});
        let second: PropertyObserver = Arc::new(|_| {});

        assert!(ledger.observe(key("username"), first).is_none());
        assert!(ledger.observe(key("username"), second).is_some());
        assert!(ledger.observer(&key("username")).is_some());
        assert!(ledger.observer(&key("password")).is_none());
    }

    #[test]
    fn drain_hands_back_every_waiter() {
        let mut ledger = Ledger::default();
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        ledger.begin_fetch(
            &VmId::from("app.UserViewModel-1"),
            Box::new(move |result: Result<ViewModelRef>| {
                assert!(matches!(result, Err(Error::Disconnected)));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        ledger.push_call(key("login"), Box::new(|_| {}));

        let drained = ledger.drain();
        assert_eq!(drained.calls.len(), 1);
        for waiter in drained.fetches {
            waiter(Err(Error::Disconnected));
        }
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.pending_calls(&key("login")), 0);
    }
}
