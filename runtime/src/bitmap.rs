// map the coverage bitmap shared with the fuzzer.

use afl_shim_common::{config::MAP_SIZE, shm};
use std::{fmt, ptr};

pub type MapBuf = [u8; MAP_SIZE];

/// Coverage map written by every forked child.
///
/// Increments are plain read-modify-write: concurrent updates from different
/// processes may be lost, which only blurs the hit counts.
pub struct SharedBitmap {
    mem: Option<shm::SHM<MapBuf>>,
    ptr: *mut u8,
}

// shm contains pointer.. The mapping is never moved nor unmapped while the
// process is alive.
unsafe impl Send for SharedBitmap {}
unsafe impl Sync for SharedBitmap {}

impl SharedBitmap {
    /// Bitmap used for standalone runs, every update is ignored.
    pub fn unattached() -> Self {
        Self {
            mem: None,
            ptr: ptr::null_mut(),
        }
    }

    pub fn attach(shm_id: i32) -> shm::Result<Self> {
        shm::SHM::<MapBuf>::from_id(shm_id).map(Self::from_shm)
    }

    pub fn from_shm(mem: shm::SHM<MapBuf>) -> Self {
        let ptr = mem.get_ptr().cast::<u8>();
        Self {
            mem: Some(mem),
            ptr,
        }
    }

    #[inline(always)]
    pub fn is_attached(&self) -> bool {
        !self.ptr.is_null()
    }

    /// Bumps the hit count at `index`, saturating at 255.
    #[inline(always)]
    pub fn bump(&self, index: usize) {
        if !self.is_attached() {
            return;
        }

        unsafe {
            let slot = self.ptr.add(index & (MAP_SIZE - 1));
            *slot = (*slot).saturating_add(1);
        }
    }

    /// Touches the first byte so that a map with few or no edges recorded
    /// still shows that the instrumentation ran.
    pub fn mark_alive(&self) {
        if self.is_attached() {
            unsafe { *self.ptr = 1 };
        }
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        if !self.is_attached() || index >= MAP_SIZE {
            return None;
        }

        Some(unsafe { *self.ptr.add(index) })
    }

    pub fn shm_id(&self) -> Option<i32> {
        self.mem.as_ref().map(|mem| mem.get_id())
    }
}

impl fmt::Debug for SharedBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.mem {
            Some(mem) => write!(f, "SharedBitmap({:?})", mem),
            None => write!(f, "SharedBitmap(unattached)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_bitmap() -> SharedBitmap {
        let mut mem = shm::SHM::<MapBuf>::new().unwrap();
        mem.clear();
        SharedBitmap::from_shm(mem)
    }

    #[test]
    fn test_unattached_ignores_updates() {
        let bitmap = SharedBitmap::unattached();
        bitmap.bump(12);
        bitmap.mark_alive();
        assert!(!bitmap.is_attached());
        assert_eq!(None, bitmap.get(12));
        assert_eq!(None, bitmap.shm_id());
    }

    #[test]
    fn test_bump_saturates() {
        let bitmap = fresh_bitmap();
        for _ in 0..300 {
            bitmap.bump(7);
        }
        assert_eq!(Some(255), bitmap.get(7));
        assert_eq!(Some(0), bitmap.get(8));
    }

    #[test]
    fn test_bump_wraps_index() {
        let bitmap = fresh_bitmap();
        bitmap.bump(MAP_SIZE + 3);
        assert_eq!(Some(1), bitmap.get(3));
    }

    #[test]
    fn test_attach_sees_same_memory() {
        let owner = fresh_bitmap();
        let view = SharedBitmap::attach(owner.shm_id().unwrap()).unwrap();
        view.bump(100);
        view.mark_alive();
        assert_eq!(Some(1), owner.get(100));
        assert_eq!(Some(1), owner.get(0));
    }
}
