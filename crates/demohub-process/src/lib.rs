use std::fmt;

use specta::Type;

const MAX_TENANT_ID_LEN: usize = 128;

/// Opaque tenant identifier owned by the project-management side.
///
/// Doubles as a workspace directory name, so `parse` only accepts ids that are
/// a single safe path component. Deserialized values are not re-validated;
/// untrusted input goes through `parse`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(transparent)]
pub struct TenantId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantIdError {
    Empty,
    TooLong,
    Invalid,
}

impl fmt::Display for TenantIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantIdError::Empty => f.write_str("tenant_id must be non-empty"),
            TenantIdError::TooLong => {
                write!(f, "tenant_id must be at most {MAX_TENANT_ID_LEN} characters")
            }
            TenantIdError::Invalid => f.write_str(
                "tenant_id may only contain ASCII letters, digits, '-', '_' and '.'",
            ),
        }
    }
}

impl std::error::Error for TenantIdError {}

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, TenantIdError> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(TenantIdError::Empty);
        }
        if id.len() > MAX_TENANT_ID_LEN {
            return Err(TenantIdError::TooLong);
        }
        if matches!(id, "." | "..")
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(TenantIdError::Invalid);
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = TenantIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    /// The demo was already up; nothing new was started.
    Running,
    /// A new process was spawned and is warming up.
    Launching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum DemoState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum PrepareState {
    Started,
    AlreadyPreparing,
    AlreadyReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    NotPrepared,
    Preparing,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct LaunchResponse {
    pub state: LaunchState,
    pub message: String,
    pub url: Option<String>,
    pub port: Option<u16>,
    pub estimated_wait_seconds: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct StatusResponse {
    pub state: DemoState,
    pub message: String,
    pub url: Option<String>,
    pub port: Option<u16>,
    /// RFC 3339, UTC.
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct StopResponse {
    pub ok: bool,
    pub was_running: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct CleanupResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct PrepareResponse {
    pub state: PrepareState,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct EnvironmentStatusResponse {
    pub state: EnvironmentState,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct StopAllResponse {
    pub demos_stopped: u32,
    pub ports_freed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct RunningDemo {
    pub tenant_id: TenantId,
    pub port: u16,
    pub pid: Option<u32>,
    /// RFC 3339, UTC.
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct LogsResponse {
    pub lines: Vec<String>,
}

/// Produced upstream when a bundle is accepted; trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct BundleManifest {
    /// Relative to the bundle root.
    pub entry_path: String,
    #[serde(default)]
    pub dependency_manifest_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_accepts_safe_ids() {
        let id = TenantId::parse("  65f1c0ffee-demo_1.v2 ").unwrap();
        assert_eq!(id.as_str(), "65f1c0ffee-demo_1.v2");
    }

    #[test]
    fn tenant_id_rejects_path_like_ids() {
        assert_eq!(TenantId::parse(""), Err(TenantIdError::Empty));
        assert_eq!(TenantId::parse(".."), Err(TenantIdError::Invalid));
        assert_eq!(TenantId::parse("a/b"), Err(TenantIdError::Invalid));
        assert_eq!(TenantId::parse("a b"), Err(TenantIdError::Invalid));
        assert_eq!(
            TenantId::parse(&"x".repeat(MAX_TENANT_ID_LEN + 1)),
            Err(TenantIdError::TooLong)
        );
    }

    #[test]
    fn tenant_id_serializes_as_plain_string() {
        let id = TenantId::parse("t1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"t1\"");
        let back: TenantId = serde_json::from_str("\"t1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn manifest_dependency_path_is_optional() {
        let m: BundleManifest = serde_json::from_str(r#"{"entry_path":"sub/app.py"}"#).unwrap();
        assert_eq!(m.entry_path, "sub/app.py");
        assert_eq!(m.dependency_manifest_path, None);
    }

    #[test]
    fn states_serialize_snake_case() {
        let v = serde_json::to_string(&PrepareState::AlreadyPreparing).unwrap();
        assert_eq!(v, "\"already_preparing\"");
        let v = serde_json::to_string(&EnvironmentState::NotPrepared).unwrap();
        assert_eq!(v, "\"not_prepared\"");
    }
}
