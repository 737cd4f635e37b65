//! Native process introspection used by the Monitor: PID liveness, zombie
//! detection, and resource metrics. Linux-native via `/proc`; degrades to
//! `None`/best-effort on other platforms rather than failing, matching the
//! original's `try/except AccessDenied` pattern.

use std::fs;

/// Snapshot of a running child's resource usage, as collected by one Monitor tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessMetrics {
    pub cpu_percent: Option<f64>,
    pub rss_mb: Option<f64>,
    pub thread_count: Option<u32>,
    pub open_connections: Option<u32>,
    pub io_read_bytes: Option<u64>,
    pub io_write_bytes: Option<u64>,
    pub uptime_secs: Option<u64>,
    pub child_count: u32,
}

impl ProcessMetrics {
    pub fn unavailable() -> Self {
        ProcessMetrics {
            cpu_percent: None,
            rss_mb: None,
            thread_count: None,
            open_connections: None,
            io_read_bytes: None,
            io_write_bytes: None,
            uptime_secs: None,
            child_count: 0,
        }
    }
}

/// True if a process with this pid exists and is not a zombie (defunct).
pub fn is_alive(pid: i64) -> bool {
    let exists = unsafe { libc::kill(pid as libc::pid_t, 0) == 0 };
    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
pub fn is_zombie(pid: i64) -> bool {
    let stat_path = format!("/proc/{}/stat", pid);
    match fs::read_to_string(&stat_path) {
        Ok(contents) => match contents.rfind(')') {
            Some(paren_end) => contents[paren_end + 1..]
                .split_whitespace()
                .next()
                .map(|state| state == "Z")
                .unwrap_or(false),
            None => false,
        },
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn is_zombie(_pid: i64) -> bool {
    false
}

/// Direct children of `pid`, enumerated via `/proc/<pid>/task/<pid>/children`.
#[cfg(target_os = "linux")]
pub fn children_of(pid: i64) -> Vec<i64> {
    let children_path = format!("/proc/{pid}/task/{pid}/children");
    fs::read_to_string(&children_path)
        .ok()
        .map(|contents| {
            contents
                .split_whitespace()
                .filter_map(|token| token.parse::<i64>().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
pub fn children_of(_pid: i64) -> Vec<i64> {
    Vec::new()
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_sec() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as f64 } else { 100.0 }
}

#[cfg(target_os = "linux")]
fn system_uptime_secs() -> Option<f64> {
    fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|contents| contents.split_whitespace().next().map(str::to_string))
        .and_then(|s| s.parse::<f64>().ok())
}

#[cfg(target_os = "linux")]
fn effective_cpu_count() -> f64 {
    if let Some(n) = read_cgroup_v2_quota("/sys/fs/cgroup/cpu.max") {
        return n;
    }
    let quota = fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .or_else(|_| fs::read_to_string("/sys/fs/cgroup/cpu,cpuacct/cpu.cfs_quota_us"));
    let period = fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .or_else(|_| fs::read_to_string("/sys/fs/cgroup/cpu,cpuacct/cpu.cfs_period_us"));
    if let (Ok(quota), Ok(period)) = (quota, period) {
        if let (Ok(quota), Ok(period)) = (quota.trim().parse::<i64>(), period.trim().parse::<i64>()) {
            if quota > 0 && period > 0 {
                return quota as f64 / period as f64;
            }
        }
    }
    num_cpus_heuristic()
}

#[cfg(target_os = "linux")]
fn read_cgroup_v2_quota(path: &str) -> Option<f64> {
    let content = fs::read_to_string(path).ok()?;
    let parts: Vec<&str> = content.trim().split_whitespace().collect();
    if parts.len() >= 2 && parts[0] != "max" {
        let quota = parts[0].parse::<f64>().ok()?;
        let period = parts[1].parse::<f64>().ok()?;
        if period > 0.0 {
            let count = quota / period;
            if count > 0.0 {
                return Some(count);
            }
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn num_cpus_heuristic() -> f64 {
    fs::read_to_string("/proc/cpuinfo")
        .map(|contents| contents.matches("processor\t:").count().max(1) as f64)
        .unwrap_or(1.0)
}

/// Collect resource metrics for a running process. Returns `ProcessMetrics::unavailable()`
/// fields for anything that can't be read (permission denied, process gone mid-read) rather
/// than failing the whole collection.
#[cfg(target_os = "linux")]
pub fn collect_metrics(pid: i64) -> ProcessMetrics {
    let stat_path = format!("/proc/{}/stat", pid);
    let stat = match fs::read_to_string(&stat_path) {
        Ok(s) => s,
        Err(_) => return ProcessMetrics::unavailable(),
    };

    let after_comm = match stat.rfind(')') {
        Some(idx) => &stat[idx + 1..],
        None => return ProcessMetrics::unavailable(),
    };
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] is state; utime/stime are fields[11]/[12] here (stat fields 14/15, 3 consumed by pid/comm/state)
    let ticks = clock_ticks_per_sec();
    let utime: f64 = fields.get(11).and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let stime: f64 = fields.get(12).and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let starttime: f64 = fields.get(19).and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let num_threads: Option<u32> = fields.get(17).and_then(|s| s.parse().ok());

    let cpu_percent = system_uptime_secs().and_then(|uptime| {
        let process_uptime = uptime - (starttime / ticks);
        if process_uptime > 0.0 {
            let process_cpu_time = (utime + stime) / ticks;
            let cores = effective_cpu_count();
            Some(((process_cpu_time / process_uptime) * 100.0 / cores).min(100.0 * cores))
        } else {
            None
        }
    });

    let uptime_secs = system_uptime_secs().map(|uptime| (uptime - (starttime / ticks)).max(0.0) as u64);

    let rss_mb = fs::read_to_string(format!("/proc/{}/statm", pid))
        .ok()
        .and_then(|statm| statm.split_whitespace().nth(1).map(str::to_string))
        .and_then(|pages| pages.parse::<f64>().ok())
        .map(|pages| (pages * page_size_bytes() as f64) / (1024.0 * 1024.0));

    let (io_read_bytes, io_write_bytes) = read_io_counters(pid);
    let open_connections = count_open_sockets(pid);
    let child_count = children_of(pid).len() as u32;

    ProcessMetrics {
        cpu_percent,
        rss_mb,
        thread_count: num_threads,
        open_connections,
        io_read_bytes,
        io_write_bytes,
        uptime_secs,
        child_count,
    }
}

#[cfg(target_os = "linux")]
fn page_size_bytes() -> i64 {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) }
}

#[cfg(target_os = "linux")]
fn read_io_counters(pid: i64) -> (Option<u64>, Option<u64>) {
    let io_path = format!("/proc/{}/io", pid);
    let contents = match fs::read_to_string(&io_path) {
        Ok(c) => c,
        Err(_) => return (None, None),
    };
    let mut read_bytes = None;
    let mut write_bytes = None;
    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("read_bytes:") {
            read_bytes = value.trim().parse::<u64>().ok();
        } else if let Some(value) = line.strip_prefix("write_bytes:") {
            write_bytes = value.trim().parse::<u64>().ok();
        }
    }
    (read_bytes, write_bytes)
}

#[cfg(target_os = "linux")]
fn count_open_sockets(pid: i64) -> Option<u32> {
    let fd_dir = format!("/proc/{}/fd", pid);
    let entries = fs::read_dir(&fd_dir).ok()?;
    let count = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .filter(|target| target.to_string_lossy().starts_with("socket:"))
        .count();
    Some(count as u32)
}

#[cfg(not(target_os = "linux"))]
pub fn collect_metrics(_pid: i64) -> ProcessMetrics {
    ProcessMetrics::unavailable()
}
