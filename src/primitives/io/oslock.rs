#![allow(unsafe_code)]
//! Advisory byte-range locks on an open file.
//!
//! POSIX record locks belong to the process, so two handles in one process
//! never conflict. In-process exclusion is the registry's job.

use std::fs::File;
use std::io;

use super::LockMode;

/// Takes `[start, start + len)` in `mode`. A non-blocking attempt that hits
/// a conflicting lock returns `Ok(false)`.
pub fn lock_region(file: &File, start: u64, len: u64, mode: LockMode, blocking: bool) -> io::Result<bool> {
    sys::lock(file, start, len, mode == LockMode::Exclusive, blocking)
}

/// Releases a range taken by [`lock_region`].
pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
    sys::unlock(file, start, len)
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    fn record(kind: libc::c_short, start: u64, len: u64) -> libc::flock {
        // SAFETY: flock is plain old data; zero is valid for every field.
        let mut rec: libc::flock = unsafe { std::mem::zeroed() };
        rec.l_type = kind;
        rec.l_whence = libc::SEEK_SET as libc::c_short;
        rec.l_start = start as libc::off_t;
        rec.l_len = len as libc::off_t;
        rec
    }

    fn fcntl(file: &File, cmd: libc::c_int, rec: &mut libc::flock) -> io::Result<()> {
        // SAFETY: the descriptor stays open while `file` is borrowed.
        match unsafe { libc::fcntl(file.as_raw_fd(), cmd, rec as *mut libc::flock) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub fn lock(file: &File, start: u64, len: u64, exclusive: bool, blocking: bool) -> io::Result<bool> {
        let kind = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
        let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };
        let mut rec = record(kind as libc::c_short, start, len);
        loop {
            let Err(err) = fcntl(file, cmd, &mut rec) else {
                return Ok(true);
            };
            match err.raw_os_error() {
                Some(libc::EINTR) if blocking => {}
                Some(libc::EAGAIN | libc::EACCES) if !blocking => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock(file: &File, start: u64, len: u64) -> io::Result<()> {
        fcntl(file, libc::F_SETLK, &mut record(libc::F_UNLCK as libc::c_short, start, len))
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    fn at(start: u64) -> OVERLAPPED {
        // SAFETY: OVERLAPPED is plain old data; zero is valid for every field.
        let mut ov: OVERLAPPED = unsafe { std::mem::zeroed() };
        ov.Anonymous.Anonymous.Offset = start as u32;
        ov.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
        ov
    }

    pub fn lock(file: &File, start: u64, len: u64, exclusive: bool, blocking: bool) -> io::Result<bool> {
        let mut flags = 0;
        if exclusive {
            flags |= LOCKFILE_EXCLUSIVE_LOCK;
        }
        if !blocking {
            flags |= LOCKFILE_FAIL_IMMEDIATELY;
        }
        let mut ov = at(start);
        // SAFETY: the handle stays open while `file` is borrowed and `ov`
        // outlives the synchronous call.
        let ok = unsafe {
            LockFileEx(file.as_raw_handle() as isize, flags, 0, len as u32, (len >> 32) as u32, &mut ov)
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if !blocking && err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            return Ok(false);
        }
        Err(err)
    }

    pub fn unlock(file: &File, start: u64, len: u64) -> io::Result<()> {
        let mut ov = at(start);
        // SAFETY: as in `lock`.
        let ok = unsafe { UnlockFileEx(file.as_raw_handle() as isize, 0, len as u32, (len >> 32) as u32, &mut ov) };
        if ok != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::fs::File;
    use std::io;

    pub fn lock(_: &File, _: u64, _: u64, _: bool, _: bool) -> io::Result<bool> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "file locking unsupported on this platform"))
    }

    pub fn unlock(_: &File, _: u64, _: u64) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "file locking unsupported on this platform"))
    }
}
