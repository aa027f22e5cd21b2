// Frame counter and per-frame buffer replication
//
// Buffers the CPU writes every frame are allocated MAX_FRAMES_IN_FLIGHT
// times over. Every access is shifted by `frame * size`, so the CPU writes
// replica N while the GPU may still read replicas N-1 and N-2. The fence
// wait at the start of each frame guarantees replica N is no longer in use.
//
// Callers must know this: a dynamic buffer is larger than requested and
// what they read back depends on the current frame.

use crate::gfx_assert;
use anyhow::{Context, Result};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of frame slots the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Shared current frame slot index.
///
/// Owned by the device and advanced by the frame loop. Buffers and
/// descriptor sets hold a clone to compute their replica offsets.
#[derive(Debug, Clone, Default)]
pub struct FrameCounter(Arc<AtomicUsize>);

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Moves to the next slot and returns it.
    pub fn advance(&self) -> usize {
        let next = (self.current() + 1) % MAX_FRAMES_IN_FLIGHT;
        self.0.store(next, Ordering::Release);
        next
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Size bookkeeping for a possibly replicated allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replicas {
    size: u64,
    dynamic: bool,
}

impl Replicas {
    pub fn new(size: u64, dynamic: bool) -> Self {
        Self { size, dynamic }
    }

    /// Size the caller asked for.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn count(&self) -> u64 {
        if self.dynamic {
            MAX_FRAMES_IN_FLIGHT as u64
        } else {
            1
        }
    }

    /// Size of the backing allocation.
    pub fn real_size(&self) -> u64 {
        self.size * self.count()
    }

    pub fn base_of_replica(&self, frame: usize) -> u64 {
        if self.dynamic {
            (frame % MAX_FRAMES_IN_FLIGHT) as u64 * self.size
        } else {
            0
        }
    }

    /// Byte range inside the allocation for a logical access. Accesses
    /// past the logical size are a programmer error: they panic in debug
    /// builds and fail in release ones.
    pub fn absolute(&self, frame: usize, offset: u64, len: u64) -> Result<Range<usize>> {
        let end = offset.checked_add(len).filter(|&end| end <= self.size);
        gfx_assert!(
            end.is_some(),
            "Access of {} bytes at offset {} overflows buffer of size {}",
            len,
            offset,
            self.size
        );
        let end = end.with_context(|| {
            format!(
                "Access of {} bytes at offset {} overflows buffer of size {}",
                len, offset, self.size
            )
        })?;
        let base = self.base_of_replica(frame);
        Ok((base + offset) as usize..(base + end) as usize)
    }

    pub fn write(&self, memory: &mut [u8], frame: usize, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.absolute(frame, offset, data.len() as u64)?;
        memory[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, memory: &[u8], frame: usize, offset: u64, out: &mut [u8]) -> Result<()> {
        let range = self.absolute(frame, offset, out.len() as u64)?;
        out.copy_from_slice(&memory[range]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};

    #[test]
    fn frame_counter_wraps() {
        let frames = FrameCounter::new();
        let shared = frames.clone();
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            frames.advance();
        }
        assert_eq!(shared.current(), 0);
        assert_eq!(frames.advance(), 1);
        frames.reset();
        assert_eq!(shared.current(), 0);
    }

    #[test]
    fn dynamic_allocation_is_scaled() {
        let replicas = Replicas::new(256, true);
        assert_eq!(replicas.real_size(), 256 * MAX_FRAMES_IN_FLIGHT as u64);
        assert_eq!(Replicas::new(256, false).real_size(), 256);
    }

    #[test]
    fn writes_land_at_frame_times_size_plus_offset() {
        let replicas = Replicas::new(64, true);
        for frame in 0..MAX_FRAMES_IN_FLIGHT {
            for offset in [0u64, 4, 60] {
                let range = replicas.absolute(frame, offset, 4).unwrap();
                assert_eq!(range.start as u64, frame as u64 * 64 + offset);
            }
        }
    }

    #[test]
    fn static_buffers_ignore_the_frame() {
        let replicas = Replicas::new(64, false);
        assert_eq!(replicas.base_of_replica(2), 0);
        assert_eq!(replicas.absolute(2, 8, 8).unwrap(), 8..16);
    }

    #[test]
    fn frame_zero_data_survives_frame_one_write() {
        let replicas = Replicas::new(16, true);
        let mut memory = vec![0u8; replicas.real_size() as usize];

        replicas.write(&mut memory, 0, 0, &[1u8; 16]).unwrap();
        replicas.write(&mut memory, 1, 0, &[2u8; 16]).unwrap();

        let mut out = [0u8; 16];
        replicas.read(&memory, 0, 0, &mut out).unwrap();
        assert_eq!(out, [1u8; 16]);
    }

    #[test]
    fn uniform_matrix_is_not_aliased_across_frames() {
        let frames = FrameCounter::new();
        let replicas = Replicas::new(256, true);
        let mut memory = vec![0u8; replicas.real_size() as usize];

        let identity = Mat4::IDENTITY;
        let scale = Mat4::from_scale(Vec3::splat(2.0));

        replicas
            .write(&mut memory, frames.current(), 0, bytemuck::bytes_of(&identity))
            .unwrap();
        frames.advance();
        replicas
            .write(&mut memory, frames.current(), 0, bytemuck::bytes_of(&scale))
            .unwrap();
        frames.advance();
        frames.advance();
        assert_eq!(frames.current(), 0);

        let mut read_back = Mat4::ZERO;
        replicas
            .read(&memory, frames.current(), 0, bytemuck::bytes_of_mut(&mut read_back))
            .unwrap();
        assert_eq!(read_back, identity);
    }

    #[test]
    #[should_panic(expected = "overflows buffer")]
    fn overflowing_access_is_caught() {
        let _ = Replicas::new(64, true).absolute(0, 60, 8);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "overflows buffer"))]
    fn offset_near_the_top_of_u64_does_not_wrap() {
        assert!(Replicas::new(64, true).absolute(1, u64::MAX - 2, 8).is_err());
    }
}
