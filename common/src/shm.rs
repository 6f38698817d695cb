use snafu::{ensure, ResultExt, Snafu};
use std::{
    self, io, mem,
    ops::{Deref, DerefMut},
    ptr, result,
};

// T must be fixed size
pub struct SHM<T: Sized> {
    id: i32,
    size: usize,
    ptr: *mut T,
    owned: bool,
}

impl<T> SHM<T> {
    /// Allocates a private segment large enough for `T` and attaches it. The
    /// segment is removed once this handle is dropped and every process has
    /// detached from it.
    pub fn new() -> Result<Self> {
        let size = mem::size_of::<T>();

        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if id == -1 {
            return Err(io::Error::last_os_error()).context(AllocFailed);
        }

        let ptr = Self::attach(id)?;

        Ok(SHM::<T> {
            id,
            size,
            ptr,
            owned: true,
        })
    }

    /// Attaches a segment created by somebody else, usually the fuzzer.
    pub fn from_id(id: i32) -> Result<Self> {
        let size = mem::size_of::<T>();

        let mut info: libc::shmid_ds = unsafe { mem::zeroed() };
        if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut info) } == -1 {
            return Err(io::Error::last_os_error()).context(AttachFailed { id });
        }
        ensure!(
            info.shm_segsz as usize >= size,
            SegmentTooSmall {
                id,
                actual: info.shm_segsz as usize,
                expected: size,
            }
        );

        let ptr = Self::attach(id)?;

        Ok(SHM::<T> {
            id,
            size,
            ptr,
            owned: false,
        })
    }

    fn attach(id: i32) -> Result<*mut T> {
        let ptr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(io::Error::last_os_error()).context(AttachFailed { id });
        }

        Ok(ptr.cast())
    }

    pub fn clear(&mut self) {
        unsafe { ptr::write_bytes(self.ptr.cast::<u8>(), 0, self.size) };
    }

    pub fn get_id(&self) -> i32 {
        self.id
    }

    pub fn get_ptr(&self) -> *mut T {
        self.ptr
    }
}

impl<T> Deref for SHM<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.ptr }
    }
}

impl<T> DerefMut for SHM<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.ptr }
    }
}

impl<T> std::fmt::Debug for SHM<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}, {}, {:p}", self.id, self.size, self.ptr)
    }
}

impl<T> Drop for SHM<T> {
    fn drop(&mut self) {
        // Attached segments stay mapped for the whole process lifetime, the
        // coverage map must not move while children are still writing to it.
        if !self.owned {
            return;
        }

        let res = unsafe { libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut()) };
        if res == -1 {
            let error = io::Error::last_os_error();
            log::warn!("shmctl({}, IPC_RMID) failed: {}", self.id, error);
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not allocate shared memory: {}", source))]
    AllocFailed { source: io::Error },
    #[snafu(display("Could not attach shared memory {}: {}", id, source))]
    AttachFailed { id: i32, source: io::Error },
    #[snafu(display(
        "Shared memory {} is {} bytes, at least {} are needed",
        id,
        actual,
        expected
    ))]
    SegmentTooSmall {
        id: i32,
        actual: usize,
        expected: usize,
    },
}
