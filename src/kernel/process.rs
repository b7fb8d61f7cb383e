//! Host process table queries via `nix` and `/proc`.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::{HashMap, VecDeque};
use std::fs;

pub trait ProcessTable: Send + Sync {
    /// Zero-signal liveness probe. Zombies count as dead.
    fn is_alive(&self, pid: u32) -> bool;

    /// Host PID of the namespace init among `spawned` and its descendants.
    fn namespace_init(&self, spawned: u32) -> Option<u32>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HostProcessTable;

impl ProcessTable for HostProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => !is_zombie(pid),
            // Exists but owned by someone else (root-owned namespace init)
            Err(Errno::EPERM) => !is_zombie(pid),
            Err(_) => false,
        }
    }

    fn namespace_init(&self, spawned: u32) -> Option<u32> {
        let table = snapshot();
        descendants(spawned, &table).into_iter().find(|pid| {
            fs::read_to_string(format!("/proc/{}/status", pid))
                .ok()
                .and_then(|status| parse_nspid(&status))
                .map(|ids| ids.len() > 1 && ids.last() == Some(&1))
                .unwrap_or(false)
        })
    }
}

fn is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| parse_stat(&stat))
        .map(|(state, _)| state == 'Z')
        .unwrap_or(false)
}

/// `(pid, ppid)` for every process currently in `/proc`.
fn snapshot() -> Vec<(u32, u32)> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Failed to read /proc: {}", e);
            return Vec::new();
        }
    };

    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|pid| {
            let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
            let (_, ppid) = parse_stat(&stat)?;
            Some((pid, ppid))
        })
        .collect()
}

/// State character and parent PID from a `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so fields are
/// located after the last `)`.
pub(crate) fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Values of the `NSpid:` line, outermost namespace first.
pub(crate) fn parse_nspid(status: &str) -> Option<Vec<u32>> {
    let line = status.lines().find(|line| line.starts_with("NSpid:"))?;
    line["NSpid:".len()..]
        .split_whitespace()
        .map(|id| id.parse().ok())
        .collect()
}

/// `root` followed by its descendants in breadth-first order.
pub(crate) fn descendants(root: u32, table: &[(u32, u32)]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, ppid) in table {
        children.entry(ppid).or_default().push(pid);
    }

    let mut order = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        order.push(pid);
        if let Some(kids) = children.get(&pid) {
            let mut kids = kids.clone();
            kids.sort_unstable();
            queue.extend(kids);
        }
    }
    order
}
