// Frame loop
//
// Cycles MAX_FRAMES_IN_FLIGHT slots independently of the swapchain image
// count. A slot's command pools are only reset after its fences have been
// observed signaled, which is what makes reusing its command buffers and
// buffer replicas safe.
//
// Command buffers go to the queue of the family their pool belongs to.
// Only the graphics submission waits for the acquired image and signals
// presentation; every other family is fenced on its own.

use anyhow::Result;
use ash::vk;
use std::collections::BTreeMap;

use crate::backend::replica::{FrameCounter, MAX_FRAMES_IN_FLIGHT};
use crate::gfx_assert;

/// A finished command buffer and the queue family it was allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    pub family_index: u32,
    pub raw: vk::CommandBuffer,
}

/// Splits a frame's buffers into the graphics batch and one batch per other
/// family. Recording order is kept inside every batch.
pub fn split_by_family(
    graphics_family: u32,
    recorded: &[Recorded],
) -> (Vec<vk::CommandBuffer>, BTreeMap<u32, Vec<vk::CommandBuffer>>) {
    let mut graphics = Vec::new();
    let mut others: BTreeMap<u32, Vec<vk::CommandBuffer>> = BTreeMap::new();
    for cmd in recorded {
        if cmd.family_index == graphics_family {
            graphics.push(cmd.raw);
        } else {
            others.entry(cmd.family_index).or_default().push(cmd.raw);
        }
    }
    (graphics, others)
}

/// The GPU side of a frame, one call per step of the frame sequence.
pub trait FrameBackend {
    /// Block until every submission of the slot finished.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    fn reset_slot_fence(&mut self, slot: usize) -> Result<()>;
    fn reset_slot_pools(&mut self, slot: usize) -> Result<()>;
    /// False when no image could be acquired this frame.
    fn acquire_image(&mut self, slot: usize) -> Result<bool>;
    /// Family whose queue ends the frame and feeds presentation.
    fn graphics_family(&self) -> u32;
    /// Backend work submitted ahead of the frame's graphics batch.
    fn record_frame_start(&mut self, slot: usize) -> Result<Option<vk::CommandBuffer>>;
    /// Backend work submitted after it. `clear_image` is set when nothing
    /// rendered into the acquired image, which still has to be cleared
    /// into the present layout.
    fn record_frame_end(&mut self, slot: usize, clear_image: bool) -> Result<Option<vk::CommandBuffer>>;
    /// Submit to the queue of `family_index`, fenced by the slot's fence
    /// for that family.
    fn submit_to_family(&mut self, slot: usize, family_index: u32, command_buffers: &[vk::CommandBuffer]) -> Result<()>;
    /// Graphics queue. Signals the slot's frame fence. `wait_for_image`
    /// also waits on the image semaphore and signals the render semaphore.
    fn submit(&mut self, slot: usize, command_buffers: &[vk::CommandBuffer], wait_for_image: bool) -> Result<()>;
    fn present(&mut self, slot: usize) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Idle,
    Recording,
    Submitted,
}

#[derive(Debug)]
pub struct FrameLoop {
    frames: FrameCounter,
    states: [SlotState; MAX_FRAMES_IN_FLIGHT],
    swapchain_drawn: bool,
}

impl FrameLoop {
    /// `frames` is the counter shared with the device, so buffer replicas
    /// follow the slot this loop is on.
    pub fn new(frames: FrameCounter) -> Self {
        Self {
            frames,
            states: [SlotState::Idle; MAX_FRAMES_IN_FLIGHT],
            swapchain_drawn: false,
        }
    }

    pub fn current_slot(&self) -> usize {
        self.frames.current()
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    pub fn is_recording(&self) -> bool {
        self.states[self.current_slot()] == SlotState::Recording
    }

    /// Note a render pass into the acquired image. True for the first one
    /// of the frame, which has to clear it.
    pub fn mark_swapchain_pass(&mut self) -> bool {
        gfx_assert!(self.is_recording(), "Swapchain pass outside of a frame");
        let first = !self.swapchain_drawn;
        self.swapchain_drawn = true;
        first
    }

    /// Returns false when the frame was skipped. The slot was then
    /// submitted empty and the loop already moved on; nothing may be
    /// recorded and `end_frame` must not be called.
    pub fn begin_frame<B: FrameBackend>(&mut self, backend: &mut B) -> Result<bool> {
        let slot = self.current_slot();
        gfx_assert!(
            self.states[slot] != SlotState::Recording,
            "begin_frame called twice without end_frame"
        );

        backend.wait_for_slot(slot)?;
        backend.reset_slot_fence(slot)?;
        backend.reset_slot_pools(slot)?;
        self.states[slot] = SlotState::Idle;
        self.swapchain_drawn = false;

        if !backend.acquire_image(slot)? {
            // Keeps the fence signaled for the next wait on this slot.
            backend.submit(slot, &[], false)?;
            self.states[slot] = SlotState::Submitted;
            self.frames.advance();
            return Ok(false);
        }

        self.states[slot] = SlotState::Recording;
        Ok(true)
    }

    pub fn end_frame<B: FrameBackend>(&mut self, backend: &mut B, recorded: &[Recorded]) -> Result<()> {
        let slot = self.current_slot();
        gfx_assert!(
            self.states[slot] == SlotState::Recording,
            "end_frame called without a successful begin_frame"
        );

        let (graphics, others) = split_by_family(backend.graphics_family(), recorded);
        for (family_index, command_buffers) in &others {
            backend.submit_to_family(slot, *family_index, command_buffers)?;
        }

        let mut frame = Vec::with_capacity(graphics.len() + 2);
        frame.extend(backend.record_frame_start(slot)?);
        frame.extend(graphics);
        frame.extend(backend.record_frame_end(slot, !self.swapchain_drawn)?);

        backend.submit(slot, &frame, true)?;
        self.states[slot] = SlotState::Submitted;
        backend.present(slot)?;
        self.frames.advance();
        Ok(())
    }

    /// Back to slot 0. Only after the device went idle.
    pub fn reset(&mut self) {
        self.frames.reset();
        self.states = [SlotState::Idle; MAX_FRAMES_IN_FLIGHT];
        self.swapchain_drawn = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const GRAPHICS: u32 = 0;
    const START: u64 = 100;
    const END: u64 = 200;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FenceState {
        Signaled,
        Unsignaled,
        Pending,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        ResetPools(usize),
        FrameEnd(usize, bool),
        SubmitFamily(usize, u32, Vec<u64>),
        Submit(usize, Vec<u64>, bool),
        Present(usize),
    }

    fn raws(command_buffers: &[vk::CommandBuffer]) -> Vec<u64> {
        command_buffers.iter().map(|cmd| cmd.as_raw()).collect()
    }

    fn recorded(family_index: u32, raw: u64) -> Recorded {
        Recorded {
            family_index,
            raw: vk::CommandBuffer::from_raw(raw),
        }
    }

    /// The GPU finishes a submission as soon as someone waits on it.
    struct FakeBackend {
        fences: [FenceState; MAX_FRAMES_IN_FLIGHT],
        family_fences: BTreeMap<(usize, u32), FenceState>,
        observed: [bool; MAX_FRAMES_IN_FLIGHT],
        acquire_results: Vec<bool>,
        timing: bool,
        events: Vec<Event>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                fences: [FenceState::Signaled; MAX_FRAMES_IN_FLIGHT],
                family_fences: BTreeMap::new(),
                observed: [false; MAX_FRAMES_IN_FLIGHT],
                acquire_results: Vec::new(),
                timing: false,
                events: Vec::new(),
            }
        }
    }

    impl FrameBackend for FakeBackend {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            assert_ne!(self.fences[slot], FenceState::Unsignaled, "waiting on a fence nothing will signal");
            self.fences[slot] = FenceState::Signaled;
            for ((fence_slot, _), state) in self.family_fences.iter_mut() {
                if *fence_slot == slot {
                    *state = FenceState::Signaled;
                }
            }
            self.observed[slot] = true;
            self.events.push(Event::Wait(slot));
            Ok(())
        }

        fn reset_slot_fence(&mut self, slot: usize) -> Result<()> {
            assert_eq!(self.fences[slot], FenceState::Signaled);
            self.fences[slot] = FenceState::Unsignaled;
            Ok(())
        }

        fn reset_slot_pools(&mut self, slot: usize) -> Result<()> {
            assert!(self.observed[slot], "pool reset before the fence was observed signaled");
            assert!(
                self.family_fences
                    .iter()
                    .all(|((fence_slot, _), state)| *fence_slot != slot || *state == FenceState::Signaled),
                "pool reset while another queue may still use it"
            );
            self.events.push(Event::ResetPools(slot));
            Ok(())
        }

        fn acquire_image(&mut self, _slot: usize) -> Result<bool> {
            Ok(if self.acquire_results.is_empty() {
                true
            } else {
                self.acquire_results.remove(0)
            })
        }

        fn graphics_family(&self) -> u32 {
            GRAPHICS
        }

        fn record_frame_start(&mut self, _slot: usize) -> Result<Option<vk::CommandBuffer>> {
            Ok(self.timing.then(|| vk::CommandBuffer::from_raw(START)))
        }

        fn record_frame_end(&mut self, slot: usize, clear_image: bool) -> Result<Option<vk::CommandBuffer>> {
            self.events.push(Event::FrameEnd(slot, clear_image));
            Ok((self.timing || clear_image).then(|| vk::CommandBuffer::from_raw(END)))
        }

        fn submit_to_family(&mut self, slot: usize, family_index: u32, command_buffers: &[vk::CommandBuffer]) -> Result<()> {
            assert_ne!(family_index, GRAPHICS);
            let fence = self
                .family_fences
                .entry((slot, family_index))
                .or_insert(FenceState::Signaled);
            assert_eq!(*fence, FenceState::Signaled, "family fence reused before it was waited on");
            *fence = FenceState::Pending;
            self.observed[slot] = false;
            self.events
                .push(Event::SubmitFamily(slot, family_index, raws(command_buffers)));
            Ok(())
        }

        fn submit(&mut self, slot: usize, command_buffers: &[vk::CommandBuffer], wait_for_image: bool) -> Result<()> {
            assert_eq!(self.fences[slot], FenceState::Unsignaled);
            self.fences[slot] = FenceState::Pending;
            self.observed[slot] = false;
            self.events
                .push(Event::Submit(slot, raws(command_buffers), wait_for_image));
            Ok(())
        }

        fn present(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Present(slot));
            Ok(())
        }
    }

    fn run_frame(frame_loop: &mut FrameLoop, backend: &mut FakeBackend) -> bool {
        if !frame_loop.begin_frame(backend).unwrap() {
            return false;
        }
        assert!(frame_loop.is_recording());
        frame_loop.mark_swapchain_pass();
        frame_loop.end_frame(backend, &[recorded(GRAPHICS, 1)]).unwrap();
        true
    }

    fn slot_events(backend: &FakeBackend, slot: usize) -> Vec<Event> {
        backend
            .events
            .iter()
            .filter(|event| match event {
                Event::Wait(s) | Event::ResetPools(s) | Event::Present(s) => *s == slot,
                Event::FrameEnd(s, _) | Event::SubmitFamily(s, _, _) | Event::Submit(s, _, _) => *s == slot,
            })
            .cloned()
            .collect()
    }

    #[test]
    fn slots_cycle_modulo_frames_in_flight() {
        let mut frame_loop = FrameLoop::new(FrameCounter::new());
        let mut backend = FakeBackend::new();

        let mut slots = Vec::new();
        for _ in 0..7 {
            slots.push(frame_loop.current_slot());
            assert!(run_frame(&mut frame_loop, &mut backend));
        }
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(frame_loop.state(0), SlotState::Submitted);
    }

    #[test]
    fn slot_reuse_waits_for_its_fence_before_resetting_pools() {
        let mut frame_loop = FrameLoop::new(FrameCounter::new());
        let mut backend = FakeBackend::new();

        for _ in 0..=MAX_FRAMES_IN_FLIGHT {
            run_frame(&mut frame_loop, &mut backend);
        }

        let frame = [
            Event::Wait(0),
            Event::ResetPools(0),
            Event::FrameEnd(0, false),
            Event::Submit(0, vec![1], true),
            Event::Present(0),
        ];
        assert_eq!(slot_events(&backend, 0), [frame.clone(), frame].concat());
    }

    #[test]
    fn skipped_frame_submits_empty_and_advances() {
        let mut frame_loop = FrameLoop::new(FrameCounter::new());
        let mut backend = FakeBackend::new();
        backend.acquire_results = vec![false];

        assert!(!run_frame(&mut frame_loop, &mut backend));
        assert_eq!(frame_loop.current_slot(), 1);
        assert_eq!(frame_loop.state(0), SlotState::Submitted);
        assert!(backend.events.contains(&Event::Submit(0, vec![], false)));
        assert!(!backend.events.contains(&Event::Present(0)));

        // Slot 0 comes around again without deadlocking on its fence.
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            assert!(run_frame(&mut frame_loop, &mut backend));
        }
        assert_eq!(frame_loop.current_slot(), 1);
    }

    #[test]
    fn non_graphics_buffers_go_to_their_own_queue() {
        let mut frame_loop = FrameLoop::new(FrameCounter::new());
        let mut backend = FakeBackend::new();

        assert!(frame_loop.begin_frame(&mut backend).unwrap());
        frame_loop.mark_swapchain_pass();
        let frame = [
            recorded(GRAPHICS, 1),
            recorded(2, 2),
            recorded(1, 3),
            recorded(GRAPHICS, 4),
            recorded(2, 5),
        ];
        frame_loop.end_frame(&mut backend, &frame).unwrap();

        assert_eq!(
            slot_events(&backend, 0)[2..],
            [
                Event::SubmitFamily(0, 1, vec![3]),
                Event::SubmitFamily(0, 2, vec![2, 5]),
                Event::FrameEnd(0, false),
                Event::Submit(0, vec![1, 4], true),
                Event::Present(0),
            ]
        );
        assert_eq!(backend.family_fences[&(0, 2)], FenceState::Pending);

        // The pools of slot 0 are only reset once the transfer and compute
        // fences were waited on too.
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            assert!(run_frame(&mut frame_loop, &mut backend));
        }
        assert_eq!(backend.family_fences[&(0, 1)], FenceState::Signaled);
        assert_eq!(backend.family_fences[&(0, 2)], FenceState::Signaled);
    }

    #[test]
    fn frame_without_swapchain_pass_still_clears_the_image() {
        let mut frame_loop = FrameLoop::new(FrameCounter::new());
        let mut backend = FakeBackend::new();

        assert!(frame_loop.begin_frame(&mut backend).unwrap());
        frame_loop.end_frame(&mut backend, &[recorded(GRAPHICS, 1)]).unwrap();

        assert!(backend.events.contains(&Event::FrameEnd(0, true)));
        assert!(backend.events.contains(&Event::Submit(0, vec![1, END], true)));
    }

    #[test]
    fn only_the_first_swapchain_pass_clears() {
        let mut frame_loop = FrameLoop::new(FrameCounter::new());
        let mut backend = FakeBackend::new();

        assert!(frame_loop.begin_frame(&mut backend).unwrap());
        assert!(frame_loop.mark_swapchain_pass());
        assert!(!frame_loop.mark_swapchain_pass());
        frame_loop.end_frame(&mut backend, &[]).unwrap();

        assert!(frame_loop.begin_frame(&mut backend).unwrap());
        assert!(frame_loop.mark_swapchain_pass());
    }

    #[test]
    fn timing_brackets_the_graphics_batch() {
        let mut frame_loop = FrameLoop::new(FrameCounter::new());
        let mut backend = FakeBackend::new();
        backend.timing = true;

        run_frame(&mut frame_loop, &mut backend);
        assert!(backend.events.contains(&Event::Submit(0, vec![START, 1, END], true)));
    }

    #[test]
    fn shared_counter_follows_the_loop() {
        let counter = FrameCounter::new();
        let mut frame_loop = FrameLoop::new(counter.clone());
        let mut backend = FakeBackend::new();

        run_frame(&mut frame_loop, &mut backend);
        run_frame(&mut frame_loop, &mut backend);
        assert_eq!(counter.current(), 2);

        frame_loop.reset();
        assert_eq!(counter.current(), 0);
        assert_eq!(frame_loop.state(1), SlotState::Idle);
    }

    #[test]
    #[should_panic(expected = "without a successful begin_frame")]
    fn end_without_begin_is_caught() {
        let mut frame_loop = FrameLoop::new(FrameCounter::new());
        let mut backend = FakeBackend::new();
        let _ = frame_loop.end_frame(&mut backend, &[]);
    }
}
