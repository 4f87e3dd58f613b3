//! Client runtime for a server-side MVVM backend.
//!
//! The backend owns every view model; this crate mirrors them over one JSON
//! WebSocket per backend address. [`Registry`] hands out a [`Session`] per
//! address, a session resolves ids into [`ViewModelRef`] proxies, and a
//! proxy exposes its properties as [`Val`]/[`Var`] handles.

pub mod config;
pub mod error;
mod ledger;
pub mod pending;
pub mod property;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sink;
pub mod transport;
pub mod view_model;

#[cfg(test)]
mod test_support;

pub use config::ClientConfig;
pub use error::{Error, ProtocolError, Result, TransportError};
pub use ledger::{FetchCallback, PropertyObserver, ReturnCallback};
pub use pending::{Pending, Subscription};
pub use property::{Phase, PropertyValue, Val, Var};
pub use protocol::{MemberKey, PropertyState, PropertyType, VmId};
pub use registry::Registry;
pub use session::{Channel, Frontend, Session};
pub use sink::{ErrorEvent, ErrorSink};
pub use transport::{Connector, Socket, Transport, WsConnector};
pub use view_model::{Getter, Member, MethodTable, ViewModelRef};

pub use serde_json;
