use std::{
    fs::File,
    io,
    os::unix::io::{FromRawFd, RawFd},
};

/// Creates an anonymous pipe and returns its `(read, write)` ends.
pub fn pipe() -> io::Result<(File, File)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // Both descriptors were just created and nobody else owns them.
    let ends = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    Ok(ends)
}
