use std::{fmt, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;

const DEFAULT_PORT_START: u16 = 8501;
const DEFAULT_PORT_END: u16 = 8600;
const DEFAULT_INSTALL_TIMEOUT_SEC: u64 = 600;
const DEFAULT_INSTALL_ATTEMPTS: usize = 2;
const DEFAULT_STOP_GRACE_SEC: u64 = 5;
const DEFAULT_LAUNCH_GRACE_MS: u64 = 2000;
const DEFAULT_ESTIMATED_WAIT_SEC: u64 = 10;

/// Inclusive range of ports handed out to demos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> anyhow::Result<Self> {
        if start == 0 {
            anyhow::bail!("invalid port range: start must be non-zero");
        }
        if start > end {
            anyhow::bail!("invalid port range: start ({start}) must not exceed end ({end})");
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub data_root: PathBuf,
    pub object_store_root: PathBuf,
    pub tenants_file: Option<PathBuf>,
    pub port_range: PortRange,
    pub public_base_url: String,
    pub install_timeout: Duration,
    pub install_attempts: usize,
    pub stop_grace: Duration,
    /// How long a SIGKILLed group gets to disappear before stop gives up.
    pub kill_wait: Duration,
    pub launch_grace: Duration,
    pub estimated_wait: Duration,
    pub python: String,
    pub baseline_package: String,
    pub http_addr: SocketAddr,
    pub log_dir: Option<PathBuf>,
    pub output_max_lines: usize,
}

impl DemoConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source; `from_env` passes
    /// the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let get_u64 = |name: &str| get(name).and_then(|v| v.parse::<u64>().ok());
        let get_u16 = |name: &str, default: u16| -> anyhow::Result<u16> {
            match get(name) {
                None => Ok(default),
                Some(raw) => raw
                    .parse::<u16>()
                    .with_context(|| format!("{name} must be a port number (got {raw})")),
            }
        };

        let data_root = absolutize(PathBuf::from(
            get("DEMOHUB_DATA_ROOT").unwrap_or_else(|| "./data".to_string()),
        ));
        let object_store_root = get("DEMOHUB_OBJECT_STORE_ROOT")
            .map(|v| absolutize(PathBuf::from(v)))
            .unwrap_or_else(|| data_root.join("objects"));
        let tenants_file = match get("DEMOHUB_TENANTS_FILE").as_deref() {
            Some("none") | Some("off") => None,
            Some(v) => Some(absolutize(PathBuf::from(v))),
            None => Some(data_root.join("tenants.json")),
        };

        let port_start = get_u16("DEMOHUB_PORT_START", DEFAULT_PORT_START)?;
        let port_end = get_u16("DEMOHUB_PORT_END", DEFAULT_PORT_END)?;
        if port_start < 1024 {
            anyhow::bail!("DEMOHUB_PORT_START must be >= 1024 (got {port_start})");
        }
        let port_range = PortRange::new(port_start, port_end)?;

        let http_addr = get("DEMOHUB_HTTP_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8000".to_string());
        let http_addr: SocketAddr = http_addr
            .parse()
            .with_context(|| format!("DEMOHUB_HTTP_ADDR must be host:port (got {http_addr})"))?;

        Ok(Self {
            data_root,
            object_store_root,
            tenants_file,
            port_range,
            public_base_url: get("DEMOHUB_PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost".to_string())
                .trim_end_matches('/')
                .to_string(),
            install_timeout: Duration::from_secs(
                get_u64("DEMOHUB_INSTALL_TIMEOUT_SEC")
                    .map(|v| v.clamp(10, 3600))
                    .unwrap_or(DEFAULT_INSTALL_TIMEOUT_SEC),
            ),
            install_attempts: get_u64("DEMOHUB_INSTALL_ATTEMPTS")
                .map(|v| v.clamp(1, 5) as usize)
                .unwrap_or(DEFAULT_INSTALL_ATTEMPTS),
            stop_grace: Duration::from_secs(
                get_u64("DEMOHUB_STOP_GRACE_SEC")
                    .map(|v| v.clamp(1, 60))
                    .unwrap_or(DEFAULT_STOP_GRACE_SEC),
            ),
            kill_wait: Duration::from_secs(2),
            launch_grace: Duration::from_millis(
                get_u64("DEMOHUB_LAUNCH_GRACE_MS")
                    .map(|v| v.clamp(200, 30_000))
                    .unwrap_or(DEFAULT_LAUNCH_GRACE_MS),
            ),
            estimated_wait: Duration::from_secs(
                get_u64("DEMOHUB_ESTIMATED_WAIT_SEC")
                    .map(|v| v.clamp(1, 600))
                    .unwrap_or(DEFAULT_ESTIMATED_WAIT_SEC),
            ),
            python: get("DEMOHUB_PYTHON").unwrap_or_else(|| "python3".to_string()),
            baseline_package: get("DEMOHUB_BASELINE_PACKAGE")
                .unwrap_or_else(|| "streamlit".to_string()),
            http_addr,
            log_dir: get("DEMOHUB_LOG_DIR").map(PathBuf::from),
            output_max_lines: get_u64("DEMOHUB_OUTPUT_MAX_LINES")
                .map(|v| v.clamp(50, 20_000) as usize)
                .unwrap_or(500),
        })
    }

    pub fn workspaces_root(&self) -> PathBuf {
        self.data_root.join("workspaces")
    }

    pub fn demo_url(&self, port: u16) -> String {
        format!("{}:{}", self.public_base_url, port)
    }
}

fn absolutize(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        return p;
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(p)
}
