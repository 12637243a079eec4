//! Host load sampling for heartbeats.

use std::time::{SystemTime, UNIX_EPOCH};

use chorus_protocol::Heartbeat;

/// Snapshot the 1/5/15 minute load averages and cpu count.
///
/// On platforms where the load average is unavailable the sample
/// reports zeros; the hub then ranks the agent as idle rather than
/// excluding it.
pub fn load_sample() -> Heartbeat {
    let mut loadavg = [0f64; 3];
    // SAFETY: getloadavg writes at most 3 doubles into the buffer.
    let written = unsafe { libc::getloadavg(loadavg.as_mut_ptr(), 3) };
    if written < 0 {
        loadavg = [0.0; 3];
    }

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    Heartbeat {
        timestamp,
        loadavg,
        cpus,
    }
}
