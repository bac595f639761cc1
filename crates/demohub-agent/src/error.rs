use std::fmt;

use demohub_process::{TenantId, TenantIdError};

use crate::config::PortRange;

/// Provisioning pipeline stage, used both for progress reporting and to say
/// where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    Downloading,
    SanitizingFiles,
    CreatingRuntime,
    InstallingDependencies,
    InstallingBaseline,
}

impl ProvisionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStage::Downloading => "downloading",
            ProvisionStage::SanitizingFiles => "sanitizing_files",
            ProvisionStage::CreatingRuntime => "creating_runtime",
            ProvisionStage::InstallingDependencies => "installing_dependencies",
            ProvisionStage::InstallingBaseline => "installing_baseline",
        }
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("no free port in range {range}")]
    ResourceExhausted { range: PortRange },

    #[error("provisioning failed while {stage}: {reason}")]
    ProvisionFailed {
        stage: ProvisionStage,
        reason: String,
        retryable: bool,
    },

    #[error("entry point not found: {entry}")]
    EntryNotFound {
        entry: String,
        tried: Vec<String>,
        present: Vec<String>,
    },

    #[error("demo failed to start: {reason}")]
    SpawnFailed { reason: String, output: String },

    #[error("failed to stop demo {tenant}: {reason}")]
    StopFailed { tenant: TenantId, reason: String },

    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    #[error("invalid tenant id: {0}")]
    InvalidTenant(#[from] TenantIdError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DemoError {
    pub fn code(&self) -> &'static str {
        match self {
            DemoError::ResourceExhausted { .. } => "resource_exhausted",
            DemoError::ProvisionFailed { .. } => "provision_failed",
            DemoError::EntryNotFound { .. } => "entry_not_found",
            DemoError::SpawnFailed { .. } => "spawn_failed",
            DemoError::StopFailed { .. } => "stop_failed",
            DemoError::UnknownTenant(_) => "unknown_tenant",
            DemoError::InvalidTenant(_) => "invalid_tenant",
            DemoError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DemoError::ResourceExhausted { .. } => true,
            DemoError::ProvisionFailed { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            DemoError::ResourceExhausted { .. } => {
                Some("All demo ports are busy. Try again in a minute.".to_string())
            }
            DemoError::ProvisionFailed {
                retryable: true, ..
            } => Some("This looks transient; launch again to retry.".to_string()),
            DemoError::ProvisionFailed { .. } => Some(
                "Clean up the environment, fix the bundle or its requirements, then launch again."
                    .to_string(),
            ),
            DemoError::EntryNotFound { .. } => Some(
                "Check that the declared entry file is part of the uploaded bundle.".to_string(),
            ),
            DemoError::SpawnFailed { .. } => Some(
                "The app exited right after starting; see the captured output for the cause."
                    .to_string(),
            ),
            DemoError::StopFailed { .. } => {
                Some("The process ignored SIGKILL; inspect the host.".to_string())
            }
            _ => None,
        }
    }
}
