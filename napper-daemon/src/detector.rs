//! Traffic observation: who received a request, and when.
//!
//! Primary source is the reverse proxy's JSON log stream; a directory of
//! combined-format access logs serves as fallback when the proxy container
//! is unavailable. Out-of-band observations arrive through per-host stamp
//! files. Scan failures never propagate; they log and yield nothing.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::NapperConfig;
use crate::hostname::{is_managed_hostname, sanitize};
use crate::runner::ContainerRuntime;

/// Bounded tail read per scan
const PROXY_LOG_TAIL: usize = 1000;

/// Entries older than this end a scan (logs are chronological)
const SCAN_HORIZON_SECS: i64 = 3600;

/// Paths that are probes, not user traffic
static PROBE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/(health|status|ping|ready|alive)/?$").unwrap());

/// Agents that are machines, not users
static AUTOMATED_AGENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(bot|crawler|spider|scraper|google|bing|yahoo|baidu|uptimerobot|pingdom|monitor|check|scan|probe)",
    )
    .unwrap()
});

/// Combined Log Format with an optional trailing vhost field
static COMBINED_LOG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(\S+) \S+ \S+ \[([^\]]+)\] "(\S+) (\S+)[^"]*" \d{3} \S+ "[^"]*" "([^"]*)"(?: (\S+))?\s*$"#,
    )
    .unwrap()
});

/// One request record from the proxy's JSON log
#[derive(Debug, Deserialize)]
struct ProxyLogRecord {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    user_agent: String,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
}

/// A record is automated (and does not count as user traffic) when it looks
/// like a probe, a bot, or an agentless client.
fn is_automated_request(path: &str, method: &str, user_agent: &str) -> bool {
    PROBE_PATH.is_match(path)
        || path.starts_with("/.well-known/acme-challenge/")
        || user_agent.is_empty()
        || method.eq_ignore_ascii_case("HEAD")
        || AUTOMATED_AGENT.is_match(user_agent)
}

pub struct RequestDetector {
    runtime: Arc<dyn ContainerRuntime>,
    clock: SharedClock,
    proxy_container: String,
    own_hostname: Option<String>,
    stamp_dir: PathBuf,
    access_log_dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RequestDetector {
    pub fn new(
        config: &NapperConfig,
        runtime: Arc<dyn ContainerRuntime>,
        clock: SharedClock,
    ) -> Self {
        Self {
            runtime,
            clock,
            proxy_container: config.proxy_container.clone(),
            own_hostname: config.own_hostname.clone(),
            stamp_dir: config.stamp_dir.clone(),
            access_log_dir: config.access_log_dir.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Scan the log sources once, fold fresh observations into the cache,
    /// and return every hostname the scan saw (filtered or not).
    pub async fn refresh(&self) -> HashSet<String> {
        let scan = match self.scan_proxy_log().await {
            Some(scan) => scan,
            None => self.scan_access_logs(),
        };

        let mut cache = self.cache.lock();
        for (host, seen_at) in scan.last_requests {
            cache
                .entry(host)
                .and_modify(|existing| *existing = (*existing).max(seen_at))
                .or_insert(seen_at);
        }
        scan.hosts
    }

    /// Most recent user-traffic timestamp for a host: the maximum of the
    /// scan-fed cache and the host's stamp file.
    pub fn last_request_time(&self, host: &str) -> Option<DateTime<Utc>> {
        let cached = self.cache.lock().get(host).copied();
        let stamped = self.read_stamp(host);
        match (cached, stamped) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// True iff the host saw user traffic within the window.
    pub fn recent_requests(&self, host: &str, within: std::time::Duration) -> bool {
        match self.last_request_time(host) {
            Some(last) => {
                let elapsed = self.clock.now() - last;
                elapsed < Duration::from_std(within).unwrap_or(Duration::MAX)
            }
            None => false,
        }
    }

    /// Union of hostnames from a fresh scan, the stamp files, and the
    /// cache, with invalid and self hostnames dropped.
    pub async fn detected_hostnames(&self) -> HashSet<String> {
        let mut hosts = self.refresh().await;
        hosts.extend(self.stamp_hosts());
        hosts.extend(self.cache.lock().keys().cloned());

        hosts
            .into_iter()
            .filter(|host| is_managed_hostname(host, self.own_hostname.as_deref()))
            .collect()
    }

    /// Record an out-of-band observation: cache it and write the stamp file.
    pub fn update_last_request_time(&self, host: &str, at: DateTime<Utc>) {
        self.cache
            .lock()
            .entry(host.to_string())
            .and_modify(|existing| *existing = (*existing).max(at))
            .or_insert(at);

        if let Err(e) = std::fs::create_dir_all(&self.stamp_dir) {
            warn!("Failed to create stamp dir {:?}: {}", self.stamp_dir, e);
            return;
        }
        let path = self.stamp_path(host);
        if let Err(e) = std::fs::write(&path, at.to_rfc3339()) {
            warn!("Failed to write stamp file {:?}: {}", path, e);
        }
    }

    fn stamp_path(&self, host: &str) -> PathBuf {
        self.stamp_dir
            .join(format!("last_request_{}", sanitize(host)))
    }

    fn read_stamp(&self, host: &str) -> Option<DateTime<Utc>> {
        let content = std::fs::read_to_string(self.stamp_path(host)).ok()?;
        parse_stamp(&content)
    }

    /// Hostnames recovered from stamp-file names.
    fn stamp_hosts(&self) -> HashSet<String> {
        let mut hosts = HashSet::new();
        let Ok(entries) = std::fs::read_dir(&self.stamp_dir) else {
            return hosts;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(host) = name.to_string_lossy().strip_prefix("last_request_") {
                hosts.insert(host.to_string());
            }
        }
        hosts
    }

    /// Tail the proxy's JSON log. Returns None when the proxy container is
    /// unavailable so the caller can fall back to access-log files.
    async fn scan_proxy_log(&self) -> Option<ScanResult> {
        let logs = match self
            .runtime
            .tail_logs(&self.proxy_container, PROXY_LOG_TAIL)
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                debug!("Proxy log unavailable: {}", e);
                return None;
            }
        };

        let horizon = self.clock.now() - Duration::seconds(SCAN_HORIZON_SECS);
        let mut result = ScanResult::default();

        // Newest lines first; stop at the horizon
        for line in logs.lines().rev() {
            let Some(record) = parse_request_record(line) else {
                continue;
            };
            let Some(time) = record.time else {
                continue;
            };
            if time < horizon {
                break;
            }
            result.observe(
                &record.host,
                time,
                is_automated_request(&record.path, &record.method, &record.user_agent),
            );
        }
        Some(result)
    }

    /// Fallback: scan combined-format access logs in the configured
    /// directory.
    fn scan_access_logs(&self) -> ScanResult {
        let mut result = ScanResult::default();
        let Some(dir) = &self.access_log_dir else {
            return result;
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Access log dir {:?} unavailable: {}", dir, e);
                return result;
            }
        };

        let horizon = self.clock.now() - Duration::seconds(SCAN_HORIZON_SECS);
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    debug!("Failed to read access log {:?}: {}", path, e);
                    continue;
                }
            };
            for line in content.lines().rev().take(PROXY_LOG_TAIL) {
                let Some((host, time, automated)) = parse_combined_line(line) else {
                    continue;
                };
                if time < horizon {
                    break;
                }
                result.observe(&host, time, automated);
            }
        }
        result
    }
}

#[derive(Debug, Default)]
struct ScanResult {
    /// Last user-traffic timestamp per host
    last_requests: HashMap<String, DateTime<Utc>>,
    /// Every host seen, including automated-only traffic
    hosts: HashSet<String>,
}

impl ScanResult {
    fn observe(&mut self, host: &str, time: DateTime<Utc>, automated: bool) {
        if host.is_empty() {
            return;
        }
        self.hosts.insert(host.to_string());
        if !automated {
            self.last_requests
                .entry(host.to_string())
                .and_modify(|existing| *existing = (*existing).max(time))
                .or_insert(time);
        }
    }
}

/// Parse one proxy log line; only `msg == "Request"` records qualify.
fn parse_request_record(line: &str) -> Option<ProxyLogRecord> {
    let record: ProxyLogRecord = serde_json::from_str(line.trim()).ok()?;
    if record.msg != "Request" {
        return None;
    }
    Some(record)
}

/// Parse a combined-log-format line into (host, time, automated).
///
/// The hostname comes from the trailing vhost field when present, else from
/// an absolute-form request target.
fn parse_combined_line(line: &str) -> Option<(String, DateTime<Utc>, bool)> {
    let caps = COMBINED_LOG.captures(line)?;
    let time = DateTime::parse_from_str(&caps[2], "%d/%b/%Y:%H:%M:%S %z")
        .ok()?
        .with_timezone(&Utc);
    let method = &caps[3];
    let target = &caps[4];
    let user_agent = caps.get(5).map_or("", |m| m.as_str());

    let host = match caps.get(6) {
        Some(vhost) => vhost.as_str().to_string(),
        None => host_from_target(target)?,
    };

    let path = if let Some(rest) = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        rest.find('/').map_or("/", |i| &rest[i..]).to_string()
    } else {
        target.to_string()
    };

    Some((
        host,
        time,
        is_automated_request(&path, method, user_agent),
    ))
}

/// Host from an absolute-form request target like `http://app.example.com/x`.
fn host_from_target(target: &str) -> Option<String> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let host = rest.split('/').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Stamp files carry one RFC3339 timestamp (epoch seconds also accepted).
fn parse_stamp(content: &str) -> Option<DateTime<Utc>> {
    let token = content.split_whitespace().next()?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(token) {
        return Some(parsed.with_timezone(&Utc));
    }
    let epoch: i64 = token.parse().ok()?;
    DateTime::from_timestamp(epoch, 0)
}
