//! Deployment Service – remote control of a deployer over the bus.
//!
//! A deployer is the component that loads scripts and knows its peers.
//! [`DeploymentService`] puts two request/response services in front of it:
//!
//! | Service                     | Request              | Response              |
//! |-----------------------------|----------------------|-----------------------|
//! | `/<deployer>/run_script`    | [`RunScriptRequest`] | [`RunScriptResponse`] |
//! | `/<deployer>/get_peer_list` | [`GetPeerListRequest`] | [`GetPeerListResponse`] |
//!
//! Payloads travel as JSON values; [`call`] wraps the encoding for clients.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowbridge_services::deployment::{self, Deployer, DeploymentService, RunScriptRequest, RunScriptResponse};
//! use flowbridge_transport::InProcessBus;
//!
//! struct Deploy;
//! impl Deployer for Deploy {
//!     fn name(&self) -> &str { "deployer" }
//!     fn run_script(&self, _file_path: &str) -> bool { true }
//!     fn peer_list(&self) -> Vec<String> { vec!["arm".into()] }
//! }
//!
//! let bus = Arc::new(InProcessBus::new().unwrap());
//! let _service = DeploymentService::advertise(Arc::new(Deploy), bus.clone()).unwrap();
//! let reply: RunScriptResponse = deployment::call(
//!     bus.as_ref(),
//!     "/deployer/run_script",
//!     &RunScriptRequest { file_path: "start.ops".into() },
//! ).unwrap();
//! assert!(reply.success);
//! ```

use std::sync::Arc;

use flowbridge_transport::{ServiceHandle, ServiceHandler, ServiceHost};
use flowbridge_types::{BusError, TransportError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Deployer
// ─────────────────────────────────────────────────────────────────────────────

/// The operations a deployer makes available remotely.
pub trait Deployer: Send + Sync + 'static {
    /// Name of the deployer; also the service namespace.
    fn name(&self) -> &str;

    /// Execute the script at `file_path`.  Returns whether it succeeded.
    fn run_script(&self, file_path: &str) -> bool;

    /// Names of the components the deployer knows about.
    fn peer_list(&self) -> Vec<String>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunScriptRequest {
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunScriptResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPeerListRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPeerListResponse {
    pub peers: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// DeploymentService
// ─────────────────────────────────────────────────────────────────────────────

/// Advertised deployment services.  Dropping it withdraws them.
pub struct DeploymentService<D: Deployer, H: ServiceHost> {
    deployer: Arc<D>,
    host: Arc<H>,
    handles: Vec<ServiceHandle>,
}

impl<D: Deployer, H: ServiceHost> DeploymentService<D, H> {
    /// Advertise `run_script` and `get_peer_list` for `deployer` on `host`.
    ///
    /// Either both services are advertised or neither is.
    ///
    /// # Errors
    ///
    /// * [`TransportError::Configuration`] when the deployer has no name.
    /// * [`TransportError::Registration`] when the host refuses a service.
    pub fn advertise(deployer: Arc<D>, host: Arc<H>) -> Result<Self, TransportError> {
        if deployer.name().is_empty() {
            return Err(TransportError::Configuration(
                "deployment services need a named deployer".to_string(),
            ));
        }
        let mut service = Self {
            deployer,
            host,
            handles: Vec::with_capacity(2),
        };
        // On failure `service` is dropped and withdraws what was advertised.
        service.add("run_script", run_script_handler(Arc::clone(&service.deployer)))?;
        service.add("get_peer_list", peer_list_handler(Arc::clone(&service.deployer)))?;

        info!(deployer = service.deployer.name(), "deployment services advertised");
        Ok(service)
    }

    fn add(&mut self, operation: &str, handler: ServiceHandler) -> Result<(), TransportError> {
        let name = service_name(self.deployer.name(), operation);
        let handle = self
            .host
            .advertise_service(&name, handler)
            .map_err(|source| TransportError::Registration { topic: name, source })?;
        self.handles.push(handle);
        Ok(())
    }

    /// Names of the advertised services.
    pub fn service_names(&self) -> Vec<&str> {
        self.handles.iter().map(ServiceHandle::name).collect()
    }

    pub fn deployer(&self) -> &Arc<D> {
        &self.deployer
    }
}

impl<D: Deployer, H: ServiceHost> Drop for DeploymentService<D, H> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            self.host.unadvertise_service(&handle);
        }
    }
}

/// `/<deployer>/<operation>`
pub fn service_name(deployer: &str, operation: &str) -> String {
    format!("/{}/{}", deployer.trim_matches('/'), operation)
}

fn run_script_handler<D: Deployer>(deployer: Arc<D>) -> ServiceHandler {
    let service = service_name(deployer.name(), "run_script");
    Arc::new(move |request: Value| -> Result<Value, BusError> {
        let request: RunScriptRequest = decode(&service, request)?;
        let success = deployer.run_script(&request.file_path);
        if !success {
            warn!(deployer = deployer.name(), file = %request.file_path, "script failed");
        }
        encode(&service, &RunScriptResponse { success })
    })
}

fn peer_list_handler<D: Deployer>(deployer: Arc<D>) -> ServiceHandler {
    let service = service_name(deployer.name(), "get_peer_list");
    Arc::new(move |request: Value| -> Result<Value, BusError> {
        let _: GetPeerListRequest = decode(&service, request)?;
        encode(&service, &GetPeerListResponse { peers: deployer.peer_list() })
    })
}

fn decode<T: DeserializeOwned>(service: &str, value: Value) -> Result<T, BusError> {
    serde_json::from_value(value).map_err(|e| BusError::ServiceFailed {
        name: service.to_string(),
        reason: format!("malformed request: {e}"),
    })
}

fn encode<T: Serialize>(service: &str, value: &T) -> Result<Value, BusError> {
    serde_json::to_value(value).map_err(|e| BusError::ServiceFailed {
        name: service.to_string(),
        reason: format!("cannot encode response: {e}"),
    })
}

/// Call a service with typed request and response.
pub fn call<H, Req, Resp>(host: &H, name: &str, request: &Req) -> Result<Resp, TransportError>
where
    H: ServiceHost + ?Sized,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let request = serde_json::to_value(request)
        .map_err(|e| TransportError::Service(format!("cannot encode request for {name}: {e}")))?;
    let reply = host
        .call_service(name, request)
        .map_err(|e| TransportError::Service(e.to_string()))?;
    serde_json::from_value(reply)
        .map_err(|e| TransportError::Service(format!("malformed reply from {name}: {e}")))
}
