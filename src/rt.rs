//! Scheduling hints for the sample path.
//!
//! The UDP reader competes with per-channel DSP workers for the CPU;
//! it must win, or datagrams get dropped at the socket. Failures here
//! are logged and otherwise ignored, since elevated scheduling
//! usually needs privileges the daemon doesn't have.

/// Real-time priority tier for input threads.
pub const INPUT_PRIORITY: i32 = 95;

/// Ask for SCHED_FIFO at the input priority for the calling thread.
#[cfg(target_os = "linux")]
pub fn elevate_input_priority() {
    let param = libc::sched_param {
        sched_priority: INPUT_PRIORITY,
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        tracing::debug!(
            error = %std::io::Error::last_os_error(),
            "could not elevate input thread priority"
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn elevate_input_priority() {}

/// Pin the calling thread to the CPU it is currently running on, so
/// the reader stops migrating between cores.
#[cfg(target_os = "linux")]
pub fn stick_to_core() {
    unsafe {
        let core = libc::sched_getcpu();
        if core < 0 {
            return;
        }
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core as usize, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            tracing::debug!(
                core,
                error = %std::io::Error::last_os_error(),
                "could not pin input thread"
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn stick_to_core() {}
