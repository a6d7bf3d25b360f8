use crate::runtime::runtime::ThreadNameFn;
#[cfg(test)]
use anyhow::{Result, anyhow};
#[cfg(test)]
use std::ffi::CStr;

const MAX_PTHREAD_NAME_LEN: usize = 16;

// Linux uses pthread_setname_np(pthread_t, *const c_char)
// It's limited to 16 bytes, including the null terminator.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_name(thread_name_fn: &ThreadNameFn) {
    let name = thread_name_fn.0();
    let len = std::cmp::min(name.len(), MAX_PTHREAD_NAME_LEN - 1);

    // Zero-initialized, so the name stays null-terminated.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for (dst, src) in c_name_buf.iter_mut().zip(&name.as_bytes()[..len]) {
        *dst = *src as libc::c_char;
    }

    let ret = unsafe { libc::pthread_setname_np(libc::pthread_self(), c_name_buf.as_ptr()) };
    if ret != 0 {
        tracing::warn!(%name, ret, "pthread_setname_np failed");
    }
}

/// Gets the name of the current thread with `pthread_getname_np`, the
/// counterpart to `pthread_setname_np`.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        libc::pthread_getname_np(
            libc::pthread_self(),
            c_name_buf.as_mut_ptr(),
            MAX_PTHREAD_NAME_LEN,
        )
    };

    if ret != 0 {
        return Err(anyhow!(
            "pthread_getname_np failed with error code: {}",
            ret
        ));
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow!("Failed to convert thread name from CStr: {}", e))
}
