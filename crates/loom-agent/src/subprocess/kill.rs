//! Process-tree termination for delegated agents.
//!
//! The child is spawned as the leader of its own process group, so a group
//! signal reaches everything it forked unless a descendant moved to another
//! group. Those are found by walking `/proc` on Linux and signalled one by one,
//! deepest first.

use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::{Signal, kill, killpg};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use tracing::debug;

/// Descendant pids of `pid`, in depth-first order.
#[cfg(target_os = "linux")]
pub fn descendants(pid: i32) -> Vec<i32> {
    fn collect(pid: i32, pids: &mut Vec<i32>) {
        let path = format!("/proc/{pid}/task/{pid}/children");
        let Ok(content) = std::fs::read_to_string(&path) else {
            return;
        };
        for part in content.split_whitespace() {
            if let Ok(child) = part.parse::<i32>() {
                pids.push(child);
                collect(child, pids);
            }
        }
    }

    let mut pids = Vec::new();
    collect(pid, &mut pids);
    pids
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn descendants(_pid: i32) -> Vec<i32> {
    Vec::new()
}

/// Send `signal` to the tree rooted at `pid`. Returns how many deliveries
/// succeeded.
#[cfg(unix)]
pub fn signal_tree(pid: u32, signal: Signal) -> usize {
    let Ok(raw) = i32::try_from(pid) else {
        return 0;
    };
    let mut delivered = 0;
    for child in descendants(raw).into_iter().rev() {
        if kill(Pid::from_raw(child), signal).is_ok() {
            delivered += 1;
        }
    }
    let root = Pid::from_raw(raw);
    if killpg(root, signal).is_ok() || kill(root, signal).is_ok() {
        delivered += 1;
    }
    debug!(pid, ?signal, delivered, "signalled process tree");
    delivered
}

/// SIGTERM the tree, then SIGKILL whatever is left once `grace` elapses.
/// Callers abort the returned future as soon as the child has exited.
#[cfg(unix)]
pub async fn terminate_tree(pid: u32, grace: Duration) {
    signal_tree(pid, Signal::SIGTERM);
    tokio::time::sleep(grace).await;
    signal_tree(pid, Signal::SIGKILL);
}

#[cfg(not(unix))]
pub async fn terminate_tree(_pid: u32, _grace: Duration) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn terminate_tree_kills_a_process_group() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30; wait")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .expect("spawn shell");
        let pid = child.id().expect("child pid");
        // Give the shell a moment to fork its sleepers.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let killer = tokio::spawn(terminate_tree(pid, Duration::from_millis(500)));
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child exits after termination")
            .expect("wait status");
        killer.abort();
        assert!(!status.success());
    }
}
