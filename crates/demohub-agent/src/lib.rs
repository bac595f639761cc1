pub mod api;
pub mod config;
pub mod error;
pub mod error_payload;
pub mod object_store;
pub mod orchestrator;
pub mod port_alloc;
pub mod port_inspect;
pub mod provisioner;
pub mod runtime;
pub mod supervisor;
mod support;
pub mod tenants;
pub mod workspace;

#[cfg(test)]
mod testing;
