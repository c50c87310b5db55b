//! OS-level liveness checks, signals and `/proc` sampling

use std::io;
use std::time::Duration;

/// Signals the supervisor sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

fn to_pid_t(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// Whether `pid` names a live (non-zombie) process
///
/// EPERM counts as alive: the process exists but belongs to someone else.
pub fn is_alive(pid: u32) -> bool {
    let Some(raw) = to_pid_t(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(raw, 0) };
    let exists = rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat_fields(&stat)
            .and_then(|fields| fields.first().copied())
            .map(|state| state == "Z" || state == "X")
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Send a signal; `Ok(false)` means the process no longer exists
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<bool> {
    let Some(raw) = to_pid_t(pid) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        ));
    };
    // SAFETY: plain syscall on a validated positive pid.
    let rc = unsafe { libc::kill(raw, signal.as_raw()) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// CPU time and thread count from `/proc/<pid>/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// user + system time
    pub cpu_time: Duration,
    pub threads: u64,
}

/// Fields after the `(comm)` entry; index 0 is the state letter
fn stat_fields(stat: &str) -> Option<Vec<&str>> {
    let close = stat.rfind(')')?;
    Some(stat[close + 1..].split_whitespace().collect())
}

fn parse_stat(stat: &str, ticks_per_sec: u64) -> Option<ProcStat> {
    let fields = stat_fields(stat)?;
    // utime(14), stime(15), num_threads(20) in proc(5) numbering
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let threads: u64 = fields.get(17)?.parse().ok()?;
    let ticks = utime + stime;
    let ticks_per_sec = ticks_per_sec.max(1);
    let millis = ticks.saturating_mul(1000) / ticks_per_sec;
    Some(ProcStat {
        cpu_time: Duration::from_millis(millis),
        threads,
    })
}

fn clock_ticks() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

pub fn read_proc_stat(pid: u32) -> io::Result<ProcStat> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid))?;
    parse_stat(&stat, clock_ticks()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unparseable /proc/{}/stat", pid),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_dead() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn test_parse_stat_handles_spaces_in_comm() {
        let stat = "1234 (my (weird) srv) S 1 1234 1234 0 -1 4194560 100 0 0 0 \
                    250 50 0 0 20 0 7 0 12345 1000000 200 18446744073709551615";
        let parsed = parse_stat(stat, 100).unwrap();
        assert_eq!(parsed.cpu_time, Duration::from_millis(3000));
        assert_eq!(parsed.threads, 7);
    }

    #[test]
    fn test_parse_stat_rejects_truncated() {
        assert!(parse_stat("1 (x) S 1 2", 100).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_own_stat() {
        let stat = read_proc_stat(std::process::id()).unwrap();
        assert!(stat.threads >= 1);
    }
}
