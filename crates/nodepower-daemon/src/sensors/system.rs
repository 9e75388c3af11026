//! Host name lookup.

use std::ffi::CStr;
use std::fs;

/// Returns the host name without its domain part.
pub fn short_hostname() -> String {
    short_name(&hostname())
}

/// Returns the system host name.
///
/// Falls back to the kernel's hostname file, then to "unknown".
pub fn hostname() -> String {
    let mut buf = [0u8; 256];

    // SAFETY: gethostname writes at most buf.len() bytes into a buffer we own;
    // the last byte is zeroed below so CStr always finds a terminator.
    let result = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len() - 1) };
    if result == 0 {
        buf[buf.len() - 1] = 0;
        if let Ok(name) = CStr::from_bytes_until_nul(&buf) {
            let name = name.to_string_lossy().trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }

    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Strips the domain from a fully qualified host name.
pub fn short_name(name: &str) -> String {
    name.split('.').next().unwrap_or(name).to_string()
}
