//! `flowbridge-services` – component-facing services built on the bridge's
//! bus contracts.
//!
//! # Modules
//!
//! - [`deployment`] – [`DeploymentService`][deployment::DeploymentService]:
//!   exposes a deployer's `run_script` and `get_peer_list` operations as bus
//!   services under the deployer's namespace.
//! - [`param`] – [`ParamFacade`][param::ParamFacade]: loads and stores a
//!   component's properties in a key/value parameter store, with the four
//!   name resolution policies.

pub mod deployment;
pub mod param;

pub use deployment::{
    Deployer, DeploymentService, GetPeerListRequest, GetPeerListResponse, RunScriptRequest,
    RunScriptResponse,
};
pub use param::{MemoryParamStore, ParamError, ParamFacade, ParamStore, ResolutionPolicy};
