use mvvm_runtime::protocol::ReturnKind;
use mvvm_runtime::{Error, ErrorEvent, PropertyValue, Registry, ViewModelRef, VmId};
use std::process;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const DEFAULT_ADDRESS: &str = "ws://localhost:8080/websocket";
const DEFAULT_ROOT_VM: &str = "app.ContentViewModel-0";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

fn main() {
    init_logging();
    if let Err(err) = run() {
        eprintln!("mvvm_inspect fatal error: {err}");
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let address = std::env::var("MVVM_ADDRESS").unwrap_or_else(|_| DEFAULT_ADDRESS.to_string());
    let root_id = VmId::from(
        std::env::var("MVVM_ROOT_VM").unwrap_or_else(|_| DEFAULT_ROOT_VM.to_string()),
    );
    let timeout = Duration::from_millis(parse_connect_timeout());

    let registry = Registry::from_env();
    registry.errors().on_error(|event| match event {
        ErrorEvent::Server(server_error) => error!(
            error_type = %server_error.error_type,
            message = %server_error.message,
            frames = server_error.stack_trace.len(),
            "backend error"
        ),
        ErrorEvent::UnrecognizedViewModel { vm_id, class_name } => {
            warn!(%vm_id, %class_name, "no view for view model")
        }
    });

    let (root_tx, root_rx) = mpsc::channel();
    registry.connect(&address, &root_id, move |_, vm| {
        let _ = root_tx.send(vm);
    })?;

    let root = match root_rx.recv_timeout(timeout) {
        Ok(root) => root,
        Err(_) => {
            print_bind_failure(&registry, &address, &root_id, timeout);
            return Err(Error::Timeout.into());
        }
    };
    describe(&root);

    // Later handshakes deliver the same cached root after a reconnect.
    for again in root_rx {
        info!(vm_id = %again.id(), "root view model re-delivered");
    }
    registry.shutdown();
    Ok(())
}

fn parse_connect_timeout() -> u64 {
    std::env::var("MVVM_CONNECT_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS)
}

fn describe(vm: &ViewModelRef) {
    info!(
        vm_id = %vm.id(),
        class = vm.class_name(),
        methods = vm.methods().len(),
        "bound root view model"
    );
    for method in vm.methods() {
        let kind = method.returns.kind();
        info!(name = %method.name, returns = %kind, args = method.args.len(), "method");
        if !matches!(kind, ReturnKind::Var | ReturnKind::Val) {
            continue;
        }
        match vm.val(&method.name) {
            Ok(property) => {
                let vm_id = vm.id().clone();
                let accessor = method.name.clone();
                property.get(move |value| {
                    info!(%vm_id, %accessor, value = %render(value), "property");
                });
            }
            Err(err) => warn!(name = %method.name, error = %err, "cannot watch property"),
        }
    }
}

fn render(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Value(value) => value.to_string(),
        PropertyValue::ViewModel(vm) => format!("<{} {}>", vm.class_name(), vm.id()),
    }
}

fn print_bind_failure(registry: &Registry, address: &str, root_id: &VmId, timeout: Duration) {
    eprintln!(
        "failed to bind {root_id} at {address} within {}ms",
        timeout.as_millis()
    );
    let history = registry.errors().history();
    if history.is_empty() {
        eprintln!("no errors reported by the backend");
    }
    for event in history {
        eprintln!("  {event}");
    }
}
