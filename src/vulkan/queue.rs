//! Per-queue submission tracking over a timeline semaphore. One semaphore
//! per queue counts submissions; finished ids come from reading its value.

use crate::error::{GpuError, Result};
use crate::types::QueueKind;
use ash::vk;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A command buffer with its dedicated pool, plus the resources its recorded
/// work references. The references are dropped when the submission retires.
pub(crate) struct TrackedCommandBuffer {
    pub pool: vk::CommandPool,
    pub buffer: vk::CommandBuffer,
    /// Recording id handed out at open time; bit 63 clear.
    pub recording_id: u64,
    /// Submission id once executed, zero while recording.
    pub submission_id: u64,
    /// Strong references dropped once the submission is observed finished.
    pub referenced: Vec<Box<dyn std::any::Any + Send + Sync>>,
}

struct QueueState {
    /// Submissions not yet observed finished, oldest first.
    in_flight: VecDeque<TrackedCommandBuffer>,
    /// Retired command buffers ready for reuse.
    pool: Vec<TrackedCommandBuffer>,
    /// Timeline waits consumed by the next submission.
    pending_waits: Vec<(vk::Semaphore, u64)>,
}

pub struct VulkanQueue {
    device: ash::Device,
    pub(crate) queue: vk::Queue,
    pub(crate) family: u32,
    pub(crate) kind: QueueKind,
    pub(crate) timeline: vk::Semaphore,
    last_recording_id: AtomicU64,
    last_submitted_id: AtomicU64,
    last_finished_id: AtomicU64,
    state: Mutex<QueueState>,
}

impl VulkanQueue {
    pub(crate) fn new(
        device: ash::Device,
        queue: vk::Queue,
        family: u32,
        kind: QueueKind,
    ) -> Result<Self> {
        let mut timeline_type = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let timeline = unsafe {
            device.create_semaphore(
                &vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_type),
                None,
            )
        }?;
        Ok(Self {
            device,
            queue,
            family,
            kind,
            timeline,
            last_recording_id: AtomicU64::new(0),
            last_submitted_id: AtomicU64::new(0),
            last_finished_id: AtomicU64::new(0),
            state: Mutex::new(QueueState {
                in_flight: VecDeque::new(),
                pool: Vec::new(),
                pending_waits: Vec::new(),
            }),
        })
    }

    /// Id for a command list that starts recording now. Recording ids and
    /// submission ids come from separate counters; each advances
    /// monotonically on its own, and a recording id never matches the
    /// submission id the list later receives.
    pub(crate) fn next_recording_id(&self) -> u64 {
        self.last_recording_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn last_submitted_id(&self) -> u64 {
        self.last_submitted_id.load(Ordering::Acquire)
    }

    pub(crate) fn last_finished_id(&self) -> u64 {
        self.last_finished_id.load(Ordering::Acquire)
    }

    /// Takes a recycled command buffer or creates a fresh pool and buffer.
    pub(crate) fn acquire_command_buffer(&self) -> Result<TrackedCommandBuffer> {
        if let Some(mut tracked) = self.state.lock().unwrap().pool.pop() {
            unsafe {
                self.device.reset_command_pool(
                    tracked.pool,
                    vk::CommandPoolResetFlags::empty(),
                )
            }?;
            tracked.recording_id = 0;
            tracked.submission_id = 0;
            tracked.referenced.clear();
            return Ok(tracked);
        }

        let pool = unsafe {
            self.device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder().queue_family_index(self.family),
                None,
            )
        }?;
        let buffers = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        };
        let buffer = match buffers {
            Ok(buffers) => buffers[0],
            Err(err) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };
        Ok(TrackedCommandBuffer {
            pool,
            buffer,
            recording_id: 0,
            submission_id: 0,
            referenced: Vec::new(),
        })
    }

    /// Queues a timeline wait consumed by the next `submit` on this queue.
    pub(crate) fn add_wait(&self, semaphore: vk::Semaphore, value: u64) {
        self.state
            .lock()
            .unwrap()
            .pending_waits
            .push((semaphore, value));
    }

    /// Submits closed command buffers as one batch signaling the next
    /// submission id on the timeline. Returns that id.
    pub(crate) fn submit(&self, mut tracked: Vec<TrackedCommandBuffer>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let submission_id = self.last_submitted_id.load(Ordering::Acquire) + 1;

        let buffers: Vec<vk::CommandBuffer> = tracked.iter().map(|t| t.buffer).collect();
        let mut wait_semaphores: Vec<vk::Semaphore> = Vec::new();
        let mut wait_values: Vec<u64> = Vec::new();
        for (semaphore, value) in state.pending_waits.drain(..) {
            wait_semaphores.push(semaphore);
            wait_values.push(value);
        }
        let wait_stages =
            vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let signal_semaphores = [self.timeline];
        let signal_values = [submission_id];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit = vk::SubmitInfo::builder()
            .command_buffers(&buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        unsafe { self.device.queue_submit(self.queue, &[submit], vk::Fence::null()) }?;
        self.last_submitted_id.store(submission_id, Ordering::Release);

        for mut t in tracked.drain(..) {
            t.submission_id = submission_id;
            state.in_flight.push_back(t);
        }
        Ok(submission_id)
    }

    /// Reads the timeline, retires finished submissions, and recycles their
    /// command buffers. Returns the updated last finished id.
    pub(crate) fn update_last_finished(&self) -> Result<u64> {
        let finished = unsafe { self.device.get_semaphore_counter_value(self.timeline) }?;
        self.last_finished_id.fetch_max(finished, Ordering::AcqRel);

        let mut state = self.state.lock().unwrap();
        while let Some(front) = state.in_flight.front() {
            if front.submission_id > finished {
                break;
            }
            let mut tracked = state.in_flight.pop_front().unwrap();
            tracked.referenced.clear();
            state.pool.push(tracked);
        }
        Ok(finished)
    }

    /// Blocks until submission `id` completes, or fails with `DeviceLost`
    /// after ten seconds.
    pub(crate) fn wait_for_submission(&self, id: u64) -> Result<()> {
        if self.last_finished_id() >= id {
            return Ok(());
        }
        let semaphores = [self.timeline];
        let values = [id];
        let wait = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        let result = unsafe { self.device.wait_semaphores(&wait, 10_000_000_000) };
        match result {
            Ok(()) => {
                self.update_last_finished()?;
                Ok(())
            }
            Err(vk::Result::TIMEOUT) => Err(GpuError::DeviceLost),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn wait_idle(&self) -> Result<()> {
        let target = self.last_submitted_id();
        self.wait_for_submission(target)
    }
}

impl Drop for VulkanQueue {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        for tracked in state.in_flight.drain(..) {
            unsafe { self.device.destroy_command_pool(tracked.pool, None) };
        }
        for tracked in state.pool.drain(..) {
            unsafe { self.device.destroy_command_pool(tracked.pool, None) };
        }
        unsafe { self.device.destroy_semaphore(self.timeline, None) };
    }
}
