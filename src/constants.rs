use std::time::Duration;

pub const BUILD_QUEUE_CAPACITY: usize = 128;
pub const PROGRESS_CAPACITY: usize = 128;
pub const STREAM_CAPACITY: usize = 128;

/// Exit code reported for a process stopped by its wall-clock deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// SIGKILL from the kernel OOM killer or a container memory cgroup.
pub const MEMORY_LIMIT_EXIT_CODE: i32 = 137;

/// How long pipe readers may keep draining after the process is gone.
pub const OUTPUT_GRACE: Duration = Duration::from_millis(500);
/// How long a killed process gets to be reaped.
pub const EXIT_GRACE: Duration = Duration::from_millis(500);
/// How long stopping a sandbox may take, e.g. `docker rm -f`.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(10);

pub const RUN_TYPE_ENV: &str = "GRADER_RUN_TYPE";
pub const SANDBOX_MOUNT: &str = "/sandbox";

pub const WORKER_STOPPED_ERR: &str = "build worker stopped before answering";
