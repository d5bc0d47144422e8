// SPDX-License-Identifier: CEPL-1.0
use ash::prelude::VkResult;
use ash::vk;
use tracing::{debug, trace};
use vkr_render::{FramePacing, FrameStatus};

use crate::context::RenderContext;
use crate::error::{VkResultExt, VkrError, VkrResult};
use crate::frame::FrameState;

/// Outcome of asking the presentation engine for an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Ready { image_index: u32, suboptimal: bool },
    /// Nothing acquired; skip this iteration. `out_of_date` means the chain
    /// no longer matches the surface.
    Retry { out_of_date: bool },
}

/// Transient acquire failures skip the frame; anything else is fatal.
pub fn classify_acquire(res: VkResult<(u32, bool)>) -> VkrResult<Acquire> {
    match res {
        Ok((image_index, suboptimal)) => Ok(Acquire::Ready {
            image_index,
            suboptimal,
        }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::Retry { out_of_date: true }),
        Err(vk::Result::NOT_READY) | Err(vk::Result::TIMEOUT) => {
            Ok(Acquire::Retry { out_of_date: false })
        }
        // surface loss included: only a new window brings it back
        Err(result) => Err(VkrError::Vk {
            call: "acquire_next_image",
            result,
        }),
    }
}

/// `Ok(true)` when the chain should be rebuilt before the next frame.
pub fn classify_present(res: VkResult<bool>) -> VkrResult<bool> {
    match res {
        Ok(suboptimal) => Ok(suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
        Err(result) => Err(VkrError::Vk {
            call: "queue_present",
            result,
        }),
    }
}

/// The calls one frame makes, in the order it makes them. The GPU-backed
/// renderer implements this; so do the tests.
pub trait FrameBackend {
    /// Make the current frame slot safe to reuse. Must not mutate anything a
    /// skipped frame would leave behind.
    fn begin_frame(&mut self) -> VkrResult<()>;
    fn acquire(&mut self) -> VkrResult<Acquire>;
    fn record(&mut self, image_index: u32) -> VkrResult<()>;
    /// Wait on the acquire signal at color-attachment output, signal release.
    fn submit(&mut self, image_index: u32) -> VkrResult<()>;
    /// Wait on the release signal. `Ok(true)` marks the chain stale.
    fn present(&mut self, image_index: u32) -> VkrResult<bool>;
    /// Host-side wait that returns the executor to idle.
    fn settle(&mut self) -> VkrResult<()>;
    fn mark_stale(&mut self);
    /// Executor state, kept across frames.
    fn frame_state(&mut self) -> &mut FrameState;
}

fn step<B: FrameBackend>(
    backend: &mut B,
    transition: fn(FrameState) -> VkrResult<FrameState>,
) -> VkrResult<()> {
    let state = backend.frame_state();
    *state = transition(*state)?;
    Ok(())
}

// STRICT PER-FRAME ORDER:
// 1) acquire (signals acquire semaphore)
// 2) record against the acquired image
// 3) submit (waits acquire @ COLOR_ATTACHMENT_OUTPUT, signals release)
// 4) present (waits release)
// 5) settle
// A failed acquire returns before 2): no recording, no submit, no present.
pub fn drive_frame<B: FrameBackend>(backend: &mut B) -> VkrResult<FrameStatus> {
    backend.begin_frame()?;

    let image_index = match backend.acquire()? {
        Acquire::Ready {
            image_index,
            suboptimal,
        } => {
            if suboptimal {
                backend.mark_stale();
            }
            image_index
        }
        Acquire::Retry { out_of_date } => {
            if out_of_date {
                backend.mark_stale();
            }
            debug!("vk: acquire not ready (out_of_date={out_of_date}), frame skipped");
            return Ok(FrameStatus::Skipped);
        }
    };

    step(backend, FrameState::begin)?;
    backend.record(image_index)?;

    step(backend, FrameState::submit)?;
    backend.submit(image_index)?;

    if backend.present(image_index)? {
        backend.mark_stale();
    }
    backend.settle()?;
    step(backend, FrameState::retire)?;

    trace!("vk: presented image {image_index}");
    Ok(FrameStatus::Presented { image_index })
}

/// Command recording resources plus the acquire signal for one frame.
pub struct FrameSlot {
    pub pool: vk::CommandPool,
    pub cmd: vk::CommandBuffer,
    pub acquire: vk::Semaphore,
    /// Only in fenced pacing; idle pacing waits for the whole device instead.
    pub in_flight: Option<vk::Fence>,
}

/// `(frame slots, release signals)` for a pacing mode and chain size.
pub fn sync_shape(pacing: FramePacing, image_count: usize) -> (usize, usize) {
    match pacing {
        FramePacing::Idle => (1, 1),
        FramePacing::Fenced => (image_count.max(1), image_count.max(1)),
    }
}

/// Acquire/release signals and per-slot command resources. Release signals
/// are indexed by image, so present never waits on a semaphore a later
/// submit is about to signal again.
pub struct FrameSync {
    pacing: FramePacing,
    slots: Vec<FrameSlot>,
    release: Vec<vk::Semaphore>,
    current: usize,
    state: FrameState,
}

impl FrameSync {
    /// Holds nothing; stands in until the first chain is built.
    pub fn empty(pacing: FramePacing) -> Self {
        Self {
            pacing,
            slots: Vec::new(),
            release: Vec::new(),
            current: 0,
            state: FrameState::Idle,
        }
    }

    pub unsafe fn create(
        ctx: &RenderContext,
        pacing: FramePacing,
        image_count: usize,
    ) -> VkrResult<Self> {
        let (slot_count, release_count) = sync_shape(pacing, image_count);
        let mut sync = Self {
            pacing,
            slots: Vec::with_capacity(slot_count),
            release: Vec::with_capacity(release_count),
            current: 0,
            state: FrameState::Idle,
        };
        if let Err(e) = sync.populate(ctx, slot_count, release_count) {
            sync.destroy(&ctx.device);
            return Err(e);
        }
        debug!("vk: frame sync {pacing:?}: {slot_count} slot(s), {release_count} release signal(s)");
        Ok(sync)
    }

    unsafe fn populate(
        &mut self,
        ctx: &RenderContext,
        slot_count: usize,
        release_count: usize,
    ) -> VkrResult<()> {
        let d = &ctx.device;
        let sem_info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };

        for _ in 0..release_count {
            self.release
                .push(d.create_semaphore(&sem_info, None).check("create_semaphore")?);
        }

        for i in 0..slot_count {
            let pool_info = vk::CommandPoolCreateInfo {
                s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                flags: vk::CommandPoolCreateFlags::TRANSIENT,
                queue_family_index: ctx.queue_family,
                ..Default::default()
            };
            let pool = d
                .create_command_pool(&pool_info, None)
                .check("create_command_pool")?;
            // pushed before anything else can fail so destroy() sees it
            self.slots.push(FrameSlot {
                pool,
                cmd: vk::CommandBuffer::null(),
                acquire: vk::Semaphore::null(),
                in_flight: None,
            });
            let slot = &mut self.slots[i];

            let alloc_info = vk::CommandBufferAllocateInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
                command_pool: pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            };
            slot.cmd = d
                .allocate_command_buffers(&alloc_info)
                .check("allocate_command_buffers")?[0];
            slot.acquire = d.create_semaphore(&sem_info, None).check("create_semaphore")?;

            if self.pacing == FramePacing::Fenced {
                // signaled so the first wait on each slot returns at once
                let fence_info = vk::FenceCreateInfo {
                    s_type: vk::StructureType::FENCE_CREATE_INFO,
                    flags: vk::FenceCreateFlags::SIGNALED,
                    ..Default::default()
                };
                slot.in_flight = Some(d.create_fence(&fence_info, None).check("create_fence")?);
            }
        }
        Ok(())
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub fn release_for(&self, image_index: u32) -> vk::Semaphore {
        self.release[image_index as usize % self.release.len()]
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len().max(1);
    }

    pub fn state_mut(&mut self) -> &mut FrameState {
        &mut self.state
    }

    pub fn pacing(&self) -> FramePacing {
        self.pacing
    }

    pub unsafe fn wait_slot(&self, device: &ash::Device) -> VkrResult<()> {
        if let Some(fence) = self.slot().in_flight {
            device
                .wait_for_fences(&[fence], true, u64::MAX)
                .check("wait_for_fences")?;
        }
        Ok(())
    }

    /// Device must be idle. Safe to call twice.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for slot in self.slots.drain(..) {
            if let Some(fence) = slot.in_flight {
                device.destroy_fence(fence, None);
            }
            if slot.acquire != vk::Semaphore::null() {
                device.destroy_semaphore(slot.acquire, None);
            }
            // frees the command buffer with it
            device.destroy_command_pool(slot.pool, None);
        }
        for sem in self.release.drain(..) {
            device.destroy_semaphore(sem, None);
        }
        self.current = 0;
        self.state = FrameState::Idle;
    }
}

pub unsafe fn acquire(
    ctx: &RenderContext,
    swapchain: vk::SwapchainKHR,
    timeout_ns: u64,
    signal: vk::Semaphore,
) -> VkrResult<Acquire> {
    classify_acquire(ctx.swapchain_loader.acquire_next_image(
        swapchain,
        timeout_ns,
        signal,
        vk::Fence::null(),
    ))
}

/// The fence, if any, is reset here rather than at frame start so a skipped
/// frame never leaves it unsignaled.
pub unsafe fn submit(
    ctx: &RenderContext,
    cmd: vk::CommandBuffer,
    wait: vk::Semaphore,
    signal: vk::Semaphore,
    fence: Option<vk::Fence>,
) -> VkrResult<()> {
    if let Some(f) = fence {
        ctx.device.reset_fences(&[f]).check("reset_fences")?;
    }

    let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
    let submit = vk::SubmitInfo {
        s_type: vk::StructureType::SUBMIT_INFO,
        wait_semaphore_count: 1,
        p_wait_semaphores: &wait,
        p_wait_dst_stage_mask: wait_stages.as_ptr(),
        command_buffer_count: 1,
        p_command_buffers: &cmd,
        signal_semaphore_count: 1,
        p_signal_semaphores: &signal,
        ..Default::default()
    };
    ctx.device
        .queue_submit(
            ctx.queue,
            std::slice::from_ref(&submit),
            fence.unwrap_or(vk::Fence::null()),
        )
        .check("queue_submit")
}

pub unsafe fn present(
    ctx: &RenderContext,
    swapchain: vk::SwapchainKHR,
    image_index: u32,
    wait: vk::Semaphore,
) -> VkrResult<bool> {
    let present = vk::PresentInfoKHR {
        s_type: vk::StructureType::PRESENT_INFO_KHR,
        wait_semaphore_count: 1,
        p_wait_semaphores: &wait,
        swapchain_count: 1,
        p_swapchains: &swapchain,
        p_image_indices: &image_index,
        ..Default::default()
    };
    classify_present(ctx.swapchain_loader.queue_present(ctx.queue, &present))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Call {
        Begin,
        Acquire,
        Record(u32),
        Submit(u32),
        Present(u32),
        Settle,
        Stale,
    }

    struct MockBackend {
        acquire: VkResult<(u32, bool)>,
        present: VkResult<bool>,
        fail_record: bool,
        state: FrameState,
        calls: Vec<Call>,
    }

    impl MockBackend {
        fn new(acquire: VkResult<(u32, bool)>) -> Self {
            Self {
                acquire,
                present: Ok(false),
                fail_record: false,
                state: FrameState::Idle,
                calls: Vec::new(),
            }
        }

        fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| f(c)).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn begin_frame(&mut self) -> VkrResult<()> {
            self.calls.push(Call::Begin);
            Ok(())
        }
        fn acquire(&mut self) -> VkrResult<Acquire> {
            self.calls.push(Call::Acquire);
            classify_acquire(self.acquire)
        }
        fn record(&mut self, image_index: u32) -> VkrResult<()> {
            self.calls.push(Call::Record(image_index));
            if self.fail_record {
                return Err(VkrError::BrokenFrame("record failed"));
            }
            Ok(())
        }
        fn submit(&mut self, image_index: u32) -> VkrResult<()> {
            self.calls.push(Call::Submit(image_index));
            Ok(())
        }
        fn present(&mut self, image_index: u32) -> VkrResult<bool> {
            self.calls.push(Call::Present(image_index));
            classify_present(self.present)
        }
        fn settle(&mut self) -> VkrResult<()> {
            self.calls.push(Call::Settle);
            Ok(())
        }
        fn mark_stale(&mut self) {
            self.calls.push(Call::Stale);
        }
        fn frame_state(&mut self) -> &mut FrameState {
            &mut self.state
        }
    }

    fn fenced(images: u64) -> FrameSync {
        use ash::vk::Handle;
        FrameSync {
            pacing: FramePacing::Fenced,
            slots: (0..images)
                .map(|i| FrameSlot {
                    pool: vk::CommandPool::from_raw(10 + i),
                    cmd: vk::CommandBuffer::from_raw(20 + i),
                    acquire: vk::Semaphore::from_raw(30 + i),
                    in_flight: Some(vk::Fence::from_raw(40 + i)),
                })
                .collect(),
            release: (0..images).map(|i| vk::Semaphore::from_raw(50 + i)).collect(),
            current: 0,
            state: FrameState::Idle,
        }
    }

    #[test]
    fn healthy_frame_runs_the_full_protocol_in_order() {
        let mut b = MockBackend::new(Ok((1, false)));
        let status = drive_frame(&mut b).unwrap();
        assert_eq!(status, FrameStatus::Presented { image_index: 1 });
        assert_eq!(
            b.calls,
            vec![
                Call::Begin,
                Call::Acquire,
                Call::Record(1),
                Call::Submit(1),
                Call::Present(1),
                Call::Settle,
            ]
        );
    }

    #[test]
    fn out_of_date_acquire_skips_without_submit_or_present() {
        let mut b = MockBackend::new(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let status = drive_frame(&mut b).unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(b.count(|c| matches!(c, Call::Record(_))), 0);
        assert_eq!(b.count(|c| matches!(c, Call::Submit(_))), 0);
        assert_eq!(b.count(|c| matches!(c, Call::Present(_))), 0);
        assert_eq!(b.calls, vec![Call::Begin, Call::Acquire, Call::Stale]);
    }

    #[test]
    fn not_ready_acquire_skips_and_keeps_the_chain() {
        for res in [vk::Result::NOT_READY, vk::Result::TIMEOUT] {
            let mut b = MockBackend::new(Err(res));
            assert_eq!(drive_frame(&mut b).unwrap(), FrameStatus::Skipped);
            assert_eq!(b.calls, vec![Call::Begin, Call::Acquire]);
        }
    }

    #[test]
    fn loop_continues_after_a_skipped_frame() {
        let mut b = MockBackend::new(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert_eq!(drive_frame(&mut b).unwrap(), FrameStatus::Skipped);
        b.acquire = Ok((0, false));
        b.calls.clear();
        assert_eq!(
            drive_frame(&mut b).unwrap(),
            FrameStatus::Presented { image_index: 0 }
        );
        assert_eq!(b.count(|c| matches!(c, Call::Submit(0))), 1);
        assert_eq!(b.count(|c| matches!(c, Call::Present(0))), 1);
    }

    #[test]
    fn device_loss_on_acquire_is_fatal() {
        let mut b = MockBackend::new(Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(drive_frame(&mut b).is_err());
        assert_eq!(b.count(|c| matches!(c, Call::Submit(_))), 0);
    }

    #[test]
    fn surface_loss_on_acquire_is_fatal() {
        let mut b = MockBackend::new(Err(vk::Result::ERROR_SURFACE_LOST_KHR));
        assert!(matches!(
            drive_frame(&mut b),
            Err(VkrError::Vk {
                call: "acquire_next_image",
                result: vk::Result::ERROR_SURFACE_LOST_KHR,
            })
        ));
        assert_eq!(b.calls, vec![Call::Begin, Call::Acquire]);
    }

    #[test]
    fn suboptimal_acquire_still_presents_but_marks_stale() {
        let mut b = MockBackend::new(Ok((2, true)));
        assert_eq!(
            drive_frame(&mut b).unwrap(),
            FrameStatus::Presented { image_index: 2 }
        );
        assert_eq!(b.calls[2], Call::Stale);
        assert_eq!(b.count(|c| matches!(c, Call::Present(2))), 1);
    }

    #[test]
    fn out_of_date_present_marks_stale_then_settles() {
        let mut b = MockBackend::new(Ok((0, false)));
        b.present = Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        drive_frame(&mut b).unwrap();
        assert_eq!(
            &b.calls[4..],
            &[Call::Present(0), Call::Stale, Call::Settle]
        );
    }

    #[test]
    fn other_present_errors_are_fatal() {
        let mut b = MockBackend::new(Ok((0, false)));
        b.present = Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        assert!(matches!(
            drive_frame(&mut b),
            Err(VkrError::Vk {
                call: "queue_present",
                ..
            })
        ));
        assert!(!b.calls.contains(&Call::Settle));
    }

    #[test]
    fn healthy_frame_leaves_the_executor_idle() {
        let mut b = MockBackend::new(Ok((0, false)));
        drive_frame(&mut b).unwrap();
        drive_frame(&mut b).unwrap();
        assert_eq!(b.state, FrameState::Idle);
    }

    #[test]
    fn recording_again_without_settling_is_rejected() {
        let mut b = MockBackend::new(Ok((0, false)));
        b.fail_record = true;
        assert!(drive_frame(&mut b).is_err());
        assert_eq!(b.state, FrameState::Recording);

        b.fail_record = false;
        b.calls.clear();
        assert!(matches!(
            drive_frame(&mut b),
            Err(VkrError::FrameState {
                state: FrameState::Recording,
                event: "begin recording",
            })
        ));
        assert_eq!(b.count(|c| matches!(c, Call::Record(_))), 0);
    }

    #[test]
    fn frame_after_failed_present_is_rejected_before_recording() {
        let mut b = MockBackend::new(Ok((1, false)));
        b.present = Err(vk::Result::ERROR_DEVICE_LOST);
        assert!(drive_frame(&mut b).is_err());
        assert_eq!(b.state, FrameState::Submitted);

        b.present = Ok(false);
        b.calls.clear();
        assert!(matches!(
            drive_frame(&mut b),
            Err(VkrError::FrameState {
                state: FrameState::Submitted,
                ..
            })
        ));
        assert!(!b.calls.contains(&Call::Record(1)));
    }

    #[test]
    fn skipped_frame_keeps_the_executor_idle() {
        let mut b = MockBackend::new(Err(vk::Result::NOT_READY));
        drive_frame(&mut b).unwrap();
        assert_eq!(b.state, FrameState::Idle);
    }

    #[test]
    fn fenced_slots_rotate_and_wrap() {
        let mut sync = fenced(3);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(sync.slot().pool);
            sync.advance();
        }
        seen.dedup();
        assert_eq!(seen.len(), 3);
        assert_eq!(sync.slot().pool, seen[0]);
        assert!(sync.slot().in_flight.is_some());
    }

    #[test]
    fn fenced_release_signal_is_per_image() {
        let sync = fenced(3);
        let release: Vec<_> = (0..3).map(|i| sync.release_for(i)).collect();
        assert_ne!(release[0], release[1]);
        assert_ne!(release[1], release[2]);
        assert_ne!(release[0], release[2]);
        // never the slot's acquire signal
        for i in 0..3u32 {
            assert!(sync.slots.iter().all(|s| s.acquire != sync.release_for(i)));
        }
    }

    #[test]
    fn empty_sync_advances_without_panicking() {
        let mut sync = FrameSync::empty(FramePacing::Idle);
        sync.advance();
        assert_eq!(sync.current, 0);
        assert_eq!(*sync.state_mut(), FrameState::Idle);
    }

    #[test]
    fn idle_pacing_uses_one_pair_fenced_scales_with_images() {
        assert_eq!(sync_shape(FramePacing::Idle, 3), (1, 1));
        assert_eq!(sync_shape(FramePacing::Fenced, 3), (3, 3));
        assert_eq!(sync_shape(FramePacing::Fenced, 0), (1, 1));
    }
}
