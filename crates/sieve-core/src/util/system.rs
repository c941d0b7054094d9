//! Thin wrappers around process-level OS capabilities.

use std::ffi::CStr;
use std::io;

use log::{debug, warn};

/// Pins the calling thread to a single CPU core.
///
/// Cycle-count deltas are only meaningful while the measuring thread stays
/// on one core, so all timing code should run after this call.
///
/// # Errors
///
/// Returns the OS error if `sched_setaffinity` fails.
pub fn pin_to_core(core: usize) -> io::Result<()> {
    let ret = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    debug!("Pinned to core {}", core);
    Ok(())
}

/// Returns the core the calling thread currently runs on.
pub fn current_cpu() -> Option<usize> {
    let cpu = unsafe { libc::sched_getcpu() };
    (cpu >= 0).then_some(cpu as usize)
}

/// `true` if the process runs with effective uid 0.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Number of physical cores of the first package as reported by `/proc/cpuinfo`.
///
/// Falls back to the number of online logical CPUs if `cpu cores` is missing.
pub fn physical_cores() -> usize {
    match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(cpuinfo) => {
            if let Some(cores) = parse_cpu_cores(&cpuinfo) {
                return cores;
            }
            warn!("No 'cpu cores' entry in /proc/cpuinfo");
        }
        Err(e) => warn!("Failed to read /proc/cpuinfo: {}", e),
    }
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online > 0 { online as usize } else { 1 }
}

fn parse_cpu_cores(cpuinfo: &str) -> Option<usize> {
    cpuinfo
        .lines()
        .filter(|l| l.starts_with("cpu cores"))
        .filter_map(|l| l.split(':').nth(1))
        .find_map(|v| v.trim().parse().ok())
}

/// Kernel release as `(major, minor)`, e.g. `(6, 8)` for `6.8.0-45-generic`.
pub fn kernel_version() -> Option<(u32, u32)> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    parse_kernel_release(&release.to_string_lossy())
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
