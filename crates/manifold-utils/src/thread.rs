use core_affinity::CoreId;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Scheduling class for a driver thread.
///
/// Anything above `OsDefault` asks for `SCHED_FIFO` at the mapped static
/// priority, which needs CAP_SYS_NICE; on refusal the thread keeps
/// running under the default scheduler (CFS).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPriority {
    #[default]
    OsDefault,
    Low,
    Medium,
    High,
    Realtime(i32),
}

impl ThreadPriority {
    fn fifo_priority(self) -> Option<i32> {
        match self {
            ThreadPriority::OsDefault => None,
            ThreadPriority::Low => Some(40),
            ThreadPriority::Medium => Some(60),
            ThreadPriority::High => Some(75),
            ThreadPriority::Realtime(priority) => Some(priority),
        }
    }

    #[cfg(target_os = "linux")]
    fn apply(self) {
        let Some(priority) = self.fifo_priority() else { return };
        let param = libc::sched_param { sched_priority: priority };
        let code = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if code != 0 {
            warn!(priority, "couldn't enter SCHED_FIFO");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply(self) {
        if self.fifo_priority().is_some() {
            warn!(priority = ?self, "realtime priority only supported on linux");
        }
    }
}

/// Pins and prioritises the calling driver thread before it enters its
/// wait loop. A core that cannot be claimed is logged and skipped, not
/// fatal.
pub fn thread_boot(core: Option<usize>, priority: ThreadPriority) {
    if let Some(core) = core {
        if !core_affinity::set_for_current(CoreId { id: core }) {
            warn!(core, "couldn't pin driver thread");
        }
    }
    priority.apply();
}
