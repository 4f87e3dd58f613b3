use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::VmId;
use crate::session::Session;
use crate::sink::ErrorSink;
use crate::transport::{Connector, Transport, WsConnector};
use crate::view_model::ViewModelRef;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Owns one session per backend address.
pub struct Registry {
    config: ClientConfig,
    errors: ErrorSink,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Registry {
    pub fn new(config: ClientConfig) -> Self {
        let errors = ErrorSink::new(config.error_history);
        Self {
            config,
            errors,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn errors(&self) -> &ErrorSink {
        &self.errors
    }

    /// Returns the session for `address`, connecting over WebSocket on first
    /// use.
    pub fn session(&self, address: &str) -> Result<Session> {
        let config = self.config.clone();
        self.get_or_open(address, move || {
            Arc::new(WsConnector::new(address, &config)) as Arc<dyn Connector>
        })
    }

    pub fn session_with(&self, address: &str, connector: Arc<dyn Connector>) -> Result<Session> {
        self.get_or_open(address, move || connector)
    }

    fn get_or_open(
        &self,
        address: &str,
        connector: impl FnOnce() -> Arc<dyn Connector>,
    ) -> Result<Session> {
        // Lookup and insert under one lock so racing callers share a session.
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(address) {
            return Ok(session.clone());
        }
        info!(%address, "opening session");
        let transport = Transport::open(connector(), &self.config)?;
        let session = Session::new(address, Arc::new(transport), self.errors.clone());
        sessions.insert(address.to_string(), session.clone());
        Ok(session)
    }

    /// Binds `root_id` on the session for `address`; `on_ready` receives
    /// every view model the handshake produces.
    pub fn connect(
        &self,
        address: &str,
        root_id: &VmId,
        on_ready: impl Fn(&Session, ViewModelRef) + Send + Sync + 'static,
    ) -> Result<Session> {
        let session = self.session(address)?;
        session.connect_to_view_model(root_id, on_ready)?;
        Ok(session)
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.sessions.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, session)| session).collect();
        for session in sessions {
            session.close();
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
