use crate::error::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const EVENT_TYPE: &str = "EventType";
pub const EVENT_PAYLOAD: &str = "EventPayload";

pub const SET_PROP: &str = "act";
pub const RETURN_PROP: &str = "show";
pub const GET_VM: &str = "getVM";
pub const RETURN_GET_VM: &str = "viewModel";
pub const CALL: &str = "call";
pub const CALL_RETURN: &str = "callReturn";
pub const ERROR: &str = "error";

pub const VM_ID: &str = "vmId";
pub const CLASS_NAME: &str = "className";
pub const PROPS: &str = "props";
pub const METHODS: &str = "methods";
pub const METHOD_NAME: &str = "name";
pub const METHOD_ARGS: &str = "args";
pub const METHOD_RETURNS: &str = "returns";
pub const TYPE_NAME: &str = "type";
pub const TYPE_IS_VM: &str = "viewable";

pub const PROP_NAME: &str = "propName";
pub const PROP_VALUE: &str = "value";
pub const PROP_TYPE: &str = "type";
pub const PROP_TYPE_NAME: &str = "name";
pub const PROP_TYPE_STATES: &str = "states";

pub const ERROR_MESSAGE: &str = "message";
pub const ERROR_STACK_TRACE: &str = "stackTrace";
pub const ERROR_TYPE: &str = "type";

/// Server-assigned view model id, e.g. `app.LoginViewModel-0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(String);

impl VmId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VmId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for VmId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&VmId> for VmId {
    fn from(id: &VmId) -> Self {
        id.clone()
    }
}

/// Correlation key: a view model id paired with a method or property name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberKey {
    pub vm_id: VmId,
    pub member: String,
}

impl MemberKey {
    pub fn new(vm_id: &VmId, member: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.clone(),
            member: member.into(),
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vm_id, self.member)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "EventType")]
pub enum ClientEnvelope {
    #[serde(rename = "getVM")]
    GetViewModel {
        #[serde(rename = "vmId")]
        vm_id: VmId,
    },
    #[serde(rename = "act")]
    SetProperty {
        #[serde(rename = "vmId")]
        vm_id: VmId,
        #[serde(rename = "propName")]
        prop_name: String,
        value: Value,
    },
    #[serde(rename = "call")]
    Call {
        #[serde(rename = "vmId")]
        vm_id: VmId,
        #[serde(rename = "EventPayload")]
        payload: CallPayload,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallPayload {
    pub name: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone)]
pub enum ServerEnvelope {
    ViewModel(ViewModelDescriptor),
    PropertyChanged(PropertyChanged),
    MethodReturned(MethodReturn),
    Error(ServerError),
}

impl ServerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::ViewModel(_) => RETURN_GET_VM,
            ServerEnvelope::PropertyChanged(_) => RETURN_PROP,
            ServerEnvelope::MethodReturned(_) => CALL_RETURN,
            ServerEnvelope::Error(_) => ERROR,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewModelDescriptor {
    #[serde(rename = "vmId")]
    pub vm_id: VmId,
    #[serde(rename = "className", default, deserialize_with = "nullable")]
    pub class_name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub props: BTreeMap<String, PropertyState>,
    #[serde(default, deserialize_with = "nullable")]
    pub methods: Vec<MethodDescriptor>,
    /// The payload exactly as the server sent it.
    #[serde(skip)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    #[serde(default, deserialize_with = "arg_list")]
    pub args: Vec<ArgDescriptor>,
    #[serde(default)]
    pub returns: ReturnType,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ArgDescriptor {
    #[serde(deserialize_with = "nullable")]
    pub name: String,
    #[serde(rename = "type", deserialize_with = "nullable")]
    pub type_name: String,
    #[serde(deserialize_with = "nullable")]
    pub viewable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReturnType {
    #[serde(rename = "type", deserialize_with = "nullable")]
    pub type_name: String,
    #[serde(deserialize_with = "nullable")]
    pub viewable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Var,
    Val,
    Value,
}

impl ReturnType {
    pub fn kind(&self) -> ReturnKind {
        match self.type_name.as_str() {
            "void" => ReturnKind::Void,
            "Var" => ReturnKind::Var,
            "Val" => ReturnKind::Val,
            _ => ReturnKind::Value,
        }
    }
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReturnKind::Void => "void",
            ReturnKind::Var => "Var",
            ReturnKind::Val => "Val",
            ReturnKind::Value => "a plain value",
        };
        f.write_str(name)
    }
}

/// A property as the server describes it in `show` pushes and in the
/// `returns` of a property accessor call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PropertyState {
    #[serde(rename = "propName")]
    pub prop_name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type", default, deserialize_with = "nullable")]
    pub prop_type: PropertyType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PropertyType {
    #[serde(deserialize_with = "nullable")]
    pub name: String,
    #[serde(deserialize_with = "nullable")]
    pub states: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub viewable: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PropertyChanged {
    #[serde(rename = "vmId")]
    pub vm_id: VmId,
    #[serde(flatten)]
    pub state: PropertyState,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodReturn {
    #[serde(rename = "vmId")]
    pub vm_id: VmId,
    pub name: String,
    #[serde(default)]
    pub returns: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerError {
    #[serde(deserialize_with = "nullable")]
    pub message: String,
    #[serde(rename = "stackTrace", deserialize_with = "nullable")]
    pub stack_trace: Vec<String>,
    #[serde(rename = "type", deserialize_with = "nullable")]
    pub error_type: String,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.error_type.is_empty(), self.message.is_empty()) {
            (true, _) => write!(f, "{}", self.message),
            (false, true) => write!(f, "{}", self.error_type),
            (false, false) => write!(f, "{}: {}", self.error_type, self.message),
        }
    }
}

pub fn get_view_model_envelope(vm_id: &VmId) -> ClientEnvelope {
    ClientEnvelope::GetViewModel {
        vm_id: vm_id.clone(),
    }
}

pub fn set_property_envelope(
    vm_id: &VmId,
    prop_name: impl Into<String>,
    value: Value,
) -> ClientEnvelope {
    ClientEnvelope::SetProperty {
        vm_id: vm_id.clone(),
        prop_name: prop_name.into(),
        value,
    }
}

pub fn call_envelope(vm_id: &VmId, name: impl Into<String>, args: Vec<Value>) -> ClientEnvelope {
    ClientEnvelope::Call {
        vm_id: vm_id.clone(),
        payload: CallPayload {
            name: name.into(),
            args,
        },
    }
}

/// Builds a method argument in the `{name, type, value}` form the backend's
/// method dispatcher reads.
pub fn typed_arg(name: impl Into<String>, type_name: impl Into<String>, value: Value) -> Value {
    let mut arg = Map::new();
    arg.insert(METHOD_NAME.to_string(), Value::String(name.into()));
    arg.insert(TYPE_NAME.to_string(), Value::String(type_name.into()));
    arg.insert(PROP_VALUE.to_string(), value);
    Value::Object(arg)
}

pub fn encode_client_envelope(envelope: &ClientEnvelope) -> Result<Value, ProtocolError> {
    serde_json::to_value(envelope).map_err(ProtocolError::Json)
}

pub fn decode_server_text(text: &str) -> Result<ServerEnvelope, ProtocolError> {
    let message: Value = serde_json::from_str(text)?;
    decode_server_envelope(message)
}

pub fn decode_server_envelope(mut message: Value) -> Result<ServerEnvelope, ProtocolError> {
    let kind = message
        .get(EVENT_TYPE)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingEventType)?
        .to_string();

    let payload = match message.get_mut(EVENT_PAYLOAD) {
        Some(payload) if !payload.is_null() => payload.take(),
        _ => return Err(ProtocolError::MissingPayload { kind }),
    };

    match kind.as_str() {
        RETURN_GET_VM => {
            let raw = payload.clone();
            let mut descriptor: ViewModelDescriptor = from_payload(&kind, payload)?;
            descriptor.raw = raw;
            Ok(ServerEnvelope::ViewModel(descriptor))
        }
        RETURN_PROP => Ok(ServerEnvelope::PropertyChanged(from_payload(&kind, payload)?)),
        CALL_RETURN => Ok(ServerEnvelope::MethodReturned(from_payload(&kind, payload)?)),
        ERROR => Ok(ServerEnvelope::Error(from_payload(&kind, payload)?)),
        _ => Err(ProtocolError::UnknownEventType(kind)),
    }
}

pub(crate) fn from_payload<T: serde::de::DeserializeOwned>(
    kind: &str,
    payload: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::Malformed {
        kind: kind.to_string(),
        source,
    })
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// The backend emits `args` as an array, as a single object, or as `{}` for
// parameterless methods.
fn arg_list<'de, D>(deserializer: D) -> Result<Vec<ArgDescriptor>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<ArgDescriptor>),
        One(ArgDescriptor),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(args)) => args,
        Some(OneOrMany::One(arg)) if arg == ArgDescriptor::default() => Vec::new(),
        Some(OneOrMany::One(arg)) => vec![arg],
    })
}
