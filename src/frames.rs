//! Physical frame storage.
//!
//! All frames of a machine live in a single anonymous memory mapping. The
//! copy and exchange engines view frames as arrays of `AtomicU64` lanes so
//! that several workers can operate on disjoint slices of the same page
//! without any further synchronization.
use crate::deps::{
    libc,
    log::{
        debug,
        error,
    },
    nix::sys::mman::{
        mmap,
        munmap,
        MapFlags,
        ProtFlags,
    },
};
use std::{
    mem,
    ptr::NonNull,
    sync::atomic::{
        AtomicBool,
        AtomicU64,
        Ordering,
    },
};

use crate::error::Error;


pub const PAGE_SIZE: usize = 4 << 10;
pub const WORDS_PER_PAGE: usize = PAGE_SIZE / mem::size_of::<u64>();

/// Largest buddy allocation the frame walker will step over; compound pages
/// beyond this order are gigantic and are not exchanged.
pub const MAX_ORDER_FRAMES: usize = 1 << 10;


pub struct FrameArena {
    base:      NonNull<u8>,
    len:       libc::size_t,
    nr_frames: usize,
    is_mapped: AtomicBool,
}

unsafe impl Send for FrameArena {}
unsafe impl Sync for FrameArena {}


impl FrameArena {
    pub fn new(nr_frames: usize) -> Result<Self, Error> {
        let len = nr_frames * PAGE_SIZE;
        debug!("mapping frame arena: {} frames, {} bytes", nr_frames, len);

        let base: *mut std::ffi::c_void = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
                -1,
                0,
            )?
        };

        Ok(Self {
            base: NonNull::new(base as *mut u8).ok_or(Error::NoMemory { what: "frame arena" })?,
            len,
            nr_frames,
            is_mapped: AtomicBool::new(true),
        })
    }

    pub fn nr_frames(&self) -> usize {
        self.nr_frames
    }

    /// Word-lane view of `nr_frames` frames starting at `frame`.
    pub fn frame_words(
        &self,
        frame: usize,
        nr_frames: usize,
    ) -> &[AtomicU64] {
        assert!(
            frame + nr_frames <= self.nr_frames,
            "frame range {}..{} outside arena of {} frames",
            frame,
            frame + nr_frames,
            self.nr_frames,
        );
        self.words_at(frame * WORDS_PER_PAGE, nr_frames * WORDS_PER_PAGE)
    }

    /// Word-lane view at an arbitrary word offset; used by the copy workers
    /// to address sub-page chunks.
    pub fn words_at(
        &self,
        word_offset: usize,
        nr_words: usize,
    ) -> &[AtomicU64] {
        let nr_total = self.len / mem::size_of::<u64>();
        assert!(word_offset + nr_words <= nr_total);

        unsafe {
            let base = self.base.as_ptr() as *const AtomicU64;
            std::slice::from_raw_parts(base.add(word_offset), nr_words)
        }
    }

    pub fn fill(
        &self,
        frame: usize,
        nr_frames: usize,
        byte: u8,
    ) {
        let pattern = u64::from_ne_bytes([byte; 8]);
        for word in self.frame_words(frame, nr_frames) {
            word.store(pattern, Ordering::Relaxed);
        }
    }

    pub fn snapshot(
        &self,
        frame: usize,
        nr_frames: usize,
    ) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(nr_frames * PAGE_SIZE);
        for word in self.frame_words(frame, nr_frames) {
            bytes.extend_from_slice(&word.load(Ordering::Relaxed).to_ne_bytes());
        }
        bytes
    }

    unsafe fn unmap_memory(&self) -> Result<(), Error> {
        munmap(self.base.as_ptr() as *mut _, self.len).map_err(|e| {
            error!(
                "an unhandled error occurred during the call to munmap({:?}, {}): {:?}",
                self.base.as_ptr(),
                self.len,
                e
            );
            e
        })?;

        self.is_mapped.store(false, Ordering::SeqCst);
        Ok(())
    }
}


impl Drop for FrameArena {
    fn drop(&mut self) {
        debug!("unmapping frame arena of {} frames", self.nr_frames);

        if self.is_mapped.load(Ordering::SeqCst) {
            unsafe {
                self.unmap_memory()
                    .unwrap_or_else(|err| error!("unable to drop FrameArena due to error {}", err));
            }
        }
    }
}


impl std::fmt::Debug for FrameArena {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter,
    ) -> std::fmt::Result {
        f.debug_struct("FrameArena")
            .field("ptr", &self.base.as_ptr())
            .field("nr_frames", &self.nr_frames)
            .field("len", &self.len)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_snapshot_round_trip() {
        let arena = FrameArena::new(4).unwrap();
        arena.fill(1, 1, 0xAA);
        arena.fill(2, 2, 0xBB);

        assert!(arena.snapshot(1, 1).iter().all(|&b| b == 0xAA));
        assert!(arena.snapshot(2, 2).iter().all(|&b| b == 0xBB));
        assert!(arena.snapshot(0, 1).iter().all(|&b| b == 0x00));
    }

    #[test]
    fn frame_views_have_word_granularity() {
        let arena = FrameArena::new(2).unwrap();
        assert_eq!(arena.frame_words(0, 1).len(), WORDS_PER_PAGE);
        assert_eq!(arena.frame_words(0, 2).len(), 2 * WORDS_PER_PAGE);
        assert_eq!(arena.words_at(WORDS_PER_PAGE / 2, 16).len(), 16);
    }

    #[test]
    #[should_panic]
    fn out_of_range_view_panics() {
        let arena = FrameArena::new(2).unwrap();
        let _ = arena.frame_words(1, 2);
    }
}
