// GPU queries
//
// Timestamp query pools and the per-slot timer built on them. Timestamps
// are raw ticks; the device's timestamp period turns them into time and
// only the low `timestamp_valid_bits` of each value are meaningful.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandBuffer;
use super::handle::Owned;
use super::VulkanDevice;

#[derive(Debug)]
pub struct QueryPool {
    raw: Owned<vk::QueryPool>,
    query_type: vk::QueryType,
    count: u32,
}

impl QueryPool {
    pub fn new(device: &Arc<VulkanDevice>, query_type: vk::QueryType, count: u32) -> Result<Self> {
        let pool_info = vk::QueryPoolCreateInfo::builder()
            .query_type(query_type)
            .query_count(count);
        let raw = unsafe { device.device.create_query_pool(&pool_info, None) }
            .context("Failed to create query pool")?;
        Ok(Self {
            raw: Owned::new(device, raw),
            query_type,
            count,
        })
    }

    pub fn raw(&self) -> vk::QueryPool {
        self.raw.raw()
    }

    pub fn query_type(&self) -> vk::QueryType {
        self.query_type
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// 64-bit results of `first..first + count`, or `None` while any of
    /// them is still pending. Does not block.
    pub fn results(&self, first: u32, count: u32) -> Result<Option<Vec<u64>>> {
        let mut data = vec![0u64; count as usize];
        let result = unsafe {
            self.raw.device().device.get_query_pool_results(
                self.raw(),
                first,
                count,
                &mut data,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match result {
            Ok(()) => Ok(Some(data)),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(e).context("Failed to read query results"),
        }
    }
}

/// Milliseconds between two raw timestamps. Handles the counter wrapping
/// around within its valid bits.
pub fn elapsed_ms(start: u64, end: u64, valid_bits: u32, period_ns: f32) -> f64 {
    let mask = if valid_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << valid_bits) - 1
    };
    let ticks = end.wrapping_sub(start) & mask;
    ticks as f64 * f64::from(period_ns) / 1_000_000.0
}

/// Start and end timestamp of one frame slot's graphics work.
#[derive(Debug)]
pub struct FrameTimer {
    pool: QueryPool,
    valid_bits: u32,
    period_ns: f32,
    written: bool,
}

impl FrameTimer {
    /// `None` when the graphics queue cannot write timestamps.
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Option<Self>> {
        let valid_bits = device.queues.graphics().family.timestamp_valid_bits();
        let period_ns = device.limits().timestamp_period;
        if valid_bits == 0 || period_ns <= 0.0 {
            return Ok(None);
        }
        Ok(Some(Self {
            pool: QueryPool::new(device, vk::QueryType::TIMESTAMP, 2)?,
            valid_bits,
            period_ns,
            written: false,
        }))
    }

    /// Must be recorded outside a render pass, before any other frame work.
    pub fn record_start(&mut self, cmd: &mut CommandBuffer) {
        cmd.reset_queries(&self.pool, 0, 2);
        cmd.write_timestamp(&self.pool, vk::PipelineStageFlags::TOP_OF_PIPE, 0);
    }

    pub fn record_end(&mut self, cmd: &mut CommandBuffer) {
        cmd.write_timestamp(&self.pool, vk::PipelineStageFlags::BOTTOM_OF_PIPE, 1);
        self.written = true;
    }

    /// GPU time of the last frame recorded with this timer, once its
    /// submission finished.
    pub fn read_ms(&mut self) -> Result<Option<f64>> {
        if !self.written {
            return Ok(None);
        }
        let Some(ticks) = self.pool.results(0, 2)? else {
            return Ok(None);
        };
        self.written = false;
        Ok(Some(elapsed_ms(ticks[0], ticks[1], self.valid_bits, self.period_ns)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_scale_by_period() {
        assert_eq!(elapsed_ms(1_000, 3_000_000, 64, 1.0), 2.999);
        assert_eq!(elapsed_ms(0, 1_000_000, 36, 2.0), 2.0);
    }

    #[test]
    fn wrapped_counter_stays_small() {
        let mask = (1u64 << 36) - 1;
        assert_eq!(elapsed_ms(mask - 9, 6, 36, 1_000_000.0), 16.0);
    }

    #[test]
    fn bits_above_the_valid_range_are_ignored() {
        let garbage = 0xABCD_u64 << 40;
        assert_eq!(elapsed_ms(garbage | 10, 20, 40, 1_000_000.0), 10.0);
    }
}
