/// Whether a process with the given pid is currently alive.
///
/// Signal 0 performs error checking only. EPERM means the process exists
/// but belongs to another user, which still counts as alive.
pub fn is_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
