use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use tokio::io::AsyncReadExt;

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

/// Async mutexes handed out per key, so work for one tenant serializes
/// without blocking other tenants. Entries nobody holds or waits on are
/// dropped on the next lookup, so the map tracks active keys only.
#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Ring buffer keeping the last `cap` bytes written to it.
pub(crate) struct TailBuffer {
    buf: Vec<u8>,
    cap: usize,
    start: usize,
    len: usize,
}

impl TailBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            buf: vec![0; cap.max(1)],
            cap: cap.max(1),
            start: 0,
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if data.len() >= self.cap {
            self.buf.copy_from_slice(&data[data.len() - self.cap..]);
            self.start = 0;
            self.len = self.cap;
            return;
        }

        let total = self.len.saturating_add(data.len());
        if total > self.cap {
            let drop = total - self.cap;
            self.start = (self.start + drop) % self.cap;
            self.len = self.cap;
        } else {
            self.len = total;
        }

        let write_pos = (self.start + self.len - data.len()) % self.cap;
        let first = (self.cap - write_pos).min(data.len());
        self.buf[write_pos..write_pos + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }
    }

    pub(crate) fn to_vec(&self) -> Vec<u8> {
        if self.len == 0 {
            return Vec::new();
        }

        if self.start + self.len <= self.cap {
            return self.buf[self.start..self.start + self.len].to_vec();
        }

        let first = self.cap - self.start;
        let second = self.len - first;
        let mut out = Vec::with_capacity(self.len);
        out.extend_from_slice(&self.buf[self.start..]);
        out.extend_from_slice(&self.buf[..second]);
        out
    }
}

pub(crate) async fn read_tail<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    limit_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut tail = TailBuffer::new(limit_bytes);
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        tail.push(&buf[..n]);
    }
    Ok(tail.to_vec())
}

/// Bounded line buffer for a supervised child's console output.
#[derive(Debug)]
pub(crate) struct LineBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LineBuffer {
    pub(crate) fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub(crate) fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub(crate) fn tail(&self, limit: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(start).cloned().collect()
    }
}
