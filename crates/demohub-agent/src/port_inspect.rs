use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    io::ErrorKind,
    net::TcpListener,
    path::Path,
};

use crate::config::PortRange;

const TCP_LISTEN: &str = "0A";

/// A listening socket inside the demo range and the processes holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortHolder {
    pub port: u16,
    pub pids: Vec<u32>,
}

/// OS-level view of the port range: bind probes, socket ownership and
/// forced termination. Swapped for a fake in tests.
pub trait PortInspector: Send + Sync + fmt::Debug {
    fn is_bindable(&self, port: u16) -> bool;

    fn listeners(&self, range: PortRange) -> Vec<PortHolder>;

    /// SIGKILLs `pid`. Returns false if the signal could not be delivered or
    /// `pid` is this process.
    fn terminate(&self, pid: u32) -> bool;
}

#[derive(Debug, Default)]
pub struct SystemPortInspector;

impl PortInspector for SystemPortInspector {
    fn is_bindable(&self, port: u16) -> bool {
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::AddrInUse => false,
            Err(e) => {
                tracing::debug!(port, error = %e, "bind probe failed");
                false
            }
        }
    }

    fn listeners(&self, range: PortRange) -> Vec<PortHolder> {
        let mut inodes: BTreeMap<u16, HashSet<u64>> = BTreeMap::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            let Ok(text) = std::fs::read_to_string(table) else {
                continue;
            };
            for (port, inode) in parse_listening_sockets(&text, range) {
                inodes.entry(port).or_default().insert(inode);
            }
        }
        if inodes.is_empty() {
            return Vec::new();
        }

        let wanted: HashSet<u64> = inodes.values().flatten().copied().collect();
        let owners = socket_owners(Path::new("/proc"), &wanted);

        inodes
            .into_iter()
            .map(|(port, socks)| {
                let mut pids: Vec<u32> = socks
                    .iter()
                    .filter_map(|inode| owners.get(inode))
                    .flatten()
                    .copied()
                    .collect();
                pids.sort_unstable();
                pids.dedup();
                PortHolder { port, pids }
            })
            .collect()
    }

    fn terminate(&self, pid: u32) -> bool {
        if pid == std::process::id() || pid == 0 {
            return false;
        }
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        // SAFETY: plain signal delivery to a positive pid.
        unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
    }
}

/// Parses a `/proc/net/tcp{,6}` table and returns `(port, inode)` for every
/// socket in LISTEN state whose local port lies in `range`.
fn parse_listening_sockets(text: &str, range: PortRange) -> Vec<(u16, u64)> {
    let mut out = Vec::new();
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[3] != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = fields[1].rsplit_once(':') else {
            continue;
        };
        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        if !range.contains(port) {
            continue;
        }
        let Ok(inode) = fields[9].parse::<u64>() else {
            continue;
        };
        if inode == 0 {
            continue;
        }
        out.push((port, inode));
    }
    out
}

fn parse_socket_link(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Maps socket inodes to the pids holding an fd on them. Processes we may not
/// inspect are skipped silently.
fn socket_owners(proc_root: &Path, wanted: &HashSet<u64>) -> HashMap<u64, Vec<u32>> {
    let mut out: HashMap<u64, Vec<u32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return out;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(link) = std::fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = link.to_str().and_then(parse_socket_link)
                && wanted.contains(&inode)
            {
                out.entry(inode).or_default().push(pid);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP_FIXTURE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:2135 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41001 1 0000000000000000 100 0 0 10 0
   1: 0100007F:2136 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41002 1 0000000000000000 100 0 0 10 0
   2: 0100007F:2137 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 41003 1 0000000000000000 20 4 30 10 -1
   3: 00000000:1F40 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 41004 1 0000000000000000 100 0 0 10 0
";

    const TCP6_FIXTURE: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:2138 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 52001 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn parses_only_listening_sockets_in_range() {
        let range = PortRange::new(8501, 8600).unwrap();
        let got = parse_listening_sockets(TCP_FIXTURE, range);
        // 0x2135 = 8501, 0x2136 = 8502; 0x2137 is ESTABLISHED, 0x1F40 = 8000 is out of range.
        assert_eq!(got, vec![(8501, 41001), (8502, 41002)]);
    }

    #[test]
    fn parses_ipv6_table() {
        let range = PortRange::new(8501, 8600).unwrap();
        assert_eq!(parse_listening_sockets(TCP6_FIXTURE, range), vec![(8504, 52001)]);
    }

    #[test]
    fn parses_socket_links() {
        assert_eq!(parse_socket_link("socket:[41001]"), Some(41001));
        assert_eq!(parse_socket_link("pipe:[41001]"), None);
        assert_eq!(parse_socket_link("/dev/null"), None);
    }

    #[test]
    fn socket_owners_reads_fd_links() {
        let dir = tempfile::tempdir().unwrap();
        let fd_dir = dir.path().join("4242").join("fd");
        std::fs::create_dir_all(&fd_dir).unwrap();
        std::os::unix::fs::symlink("socket:[41001]", fd_dir.join("3")).unwrap();
        std::os::unix::fs::symlink("socket:[99999]", fd_dir.join("4")).unwrap();
        std::fs::create_dir_all(dir.path().join("self-not-a-pid")).unwrap();

        let wanted: HashSet<u64> = [41001].into_iter().collect();
        let owners = socket_owners(dir.path(), &wanted);
        assert_eq!(owners.get(&41001), Some(&vec![4242]));
        assert!(!owners.contains_key(&99999));
    }

    #[test]
    fn never_terminates_self() {
        assert!(!SystemPortInspector.terminate(std::process::id()));
    }

    #[test]
    fn bound_port_is_not_bindable() {
        let l = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = l.local_addr().unwrap().port();
        assert!(!SystemPortInspector.is_bindable(port));
        drop(l);
    }
}
