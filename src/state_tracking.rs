//! Backend-agnostic resource-state tracking.
//!
//! The command list registers every texture/buffer it touches here, requests
//! the states those touches need, and flushes the accumulated transitions at
//! `commit_barriers()`. Backends translate the pending [`TextureBarrier`] /
//! [`BufferBarrier`] records into their native barrier calls.

use crate::error::MessageSink;
use crate::types::{ResourceStates, TextureSubresourceSet, ALL_ARRAY_SLICES, ALL_MIPS};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Stable identity of a tracked resource, assigned once at resource
/// creation. Using an id instead of the handle keeps the tracker free of
/// strong references; the command list itself retains the resources.
pub type TrackingId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBarrier {
    pub id: TrackingId,
    pub entire_texture: bool,
    pub mip_level: u32,
    pub array_slice: u32,
    pub before: ResourceStates,
    pub after: ResourceStates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub id: TrackingId,
    pub before: ResourceStates,
    pub after: ResourceStates,
}

#[derive(Debug)]
struct TextureState {
    mip_levels: u32,
    array_size: u32,
    /// One entry per subresource, mip-major.
    subresource_states: Vec<ResourceStates>,
    initial_state: ResourceStates,
    keep_initial_state: bool,
    permanent: bool,
    enable_uav_barriers: bool,
    first_uav_barrier_placed: bool,
}

impl TextureState {
    fn subresource_index(&self, mip: u32, slice: u32) -> usize {
        (slice * self.mip_levels + mip) as usize
    }

    fn uniform_state(&self) -> Option<ResourceStates> {
        let first = *self.subresource_states.first()?;
        self.subresource_states
            .iter()
            .all(|s| *s == first)
            .then_some(first)
    }
}

#[derive(Debug)]
struct BufferState {
    state: ResourceStates,
    initial_state: ResourceStates,
    keep_initial_state: bool,
    permanent: bool,
    enable_uav_barriers: bool,
    first_uav_barrier_placed: bool,
}

/// Per-command-list state tracker.
#[derive(Default)]
pub struct ResourceStateTracker {
    textures: HashMap<TrackingId, TextureState>,
    buffers: HashMap<TrackingId, BufferState>,
    texture_barriers: SmallVec<[TextureBarrier; 8]>,
    buffer_barriers: SmallVec<[BufferBarrier; 8]>,
    messages: MessageSink,
}

fn resolve_set(
    set: TextureSubresourceSet,
    mip_levels: u32,
    array_size: u32,
) -> (u32, u32, u32, u32) {
    let base_mip = set.base_mip.min(mip_levels.saturating_sub(1));
    let mips = if set.mip_count == ALL_MIPS {
        mip_levels - base_mip
    } else {
        set.mip_count.min(mip_levels - base_mip)
    };
    let base_slice = set.base_array_slice.min(array_size.saturating_sub(1));
    let slices = if set.array_slice_count == ALL_ARRAY_SLICES {
        array_size - base_slice
    } else {
        set.array_slice_count.min(array_size - base_slice)
    };
    (base_mip, mips, base_slice, slices)
}

impl ResourceStateTracker {
    pub fn new(messages: MessageSink) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Registers a texture with the tracker. Idempotent; later calls with
    /// the same id are ignored.
    pub fn begin_tracking_texture(
        &mut self,
        id: TrackingId,
        mip_levels: u32,
        array_size: u32,
        initial_state: ResourceStates,
        keep_initial_state: bool,
    ) {
        self.textures.entry(id).or_insert_with(|| TextureState {
            mip_levels,
            array_size,
            subresource_states: vec![initial_state; (mip_levels * array_size) as usize],
            initial_state,
            keep_initial_state,
            permanent: false,
            enable_uav_barriers: true,
            first_uav_barrier_placed: false,
        });
    }

    pub fn begin_tracking_buffer(
        &mut self,
        id: TrackingId,
        initial_state: ResourceStates,
        keep_initial_state: bool,
    ) {
        self.buffers.entry(id).or_insert_with(|| BufferState {
            state: initial_state,
            initial_state,
            keep_initial_state,
            permanent: false,
            enable_uav_barriers: true,
            first_uav_barrier_placed: false,
        });
    }

    /// Overwrites the tracked state of `subresources` without recording a
    /// barrier. For callers that know the current layout out of band.
    pub fn set_texture_state(
        &mut self,
        id: TrackingId,
        subresources: TextureSubresourceSet,
        state: ResourceStates,
    ) {
        let Some(ts) = self.textures.get_mut(&id) else {
            return;
        };
        if ts.permanent {
            return;
        }
        let (base_mip, mips, base_slice, slices) =
            resolve_set(subresources, ts.mip_levels, ts.array_size);
        for slice in base_slice..base_slice + slices {
            for mip in base_mip..base_mip + mips {
                let idx = ts.subresource_index(mip, slice);
                ts.subresource_states[idx] = state;
            }
        }
    }

    pub fn is_tracking_texture(&self, id: TrackingId) -> bool {
        self.textures.contains_key(&id)
    }

    pub fn is_tracking_buffer(&self, id: TrackingId) -> bool {
        self.buffers.contains_key(&id)
    }

    pub fn texture_subresource_state(
        &self,
        id: TrackingId,
        mip: u32,
        slice: u32,
    ) -> Option<ResourceStates> {
        let ts = self.textures.get(&id)?;
        ts.subresource_states
            .get(ts.subresource_index(mip, slice))
            .copied()
    }

    pub fn buffer_state(&self, id: TrackingId) -> Option<ResourceStates> {
        self.buffers.get(&id).map(|b| b.state)
    }

    /// Records the transitions needed to put `subresources` into `state`.
    pub fn require_texture_state(
        &mut self,
        id: TrackingId,
        subresources: TextureSubresourceSet,
        state: ResourceStates,
    ) {
        let Some(ts) = self.textures.get_mut(&id) else {
            self.messages.warning(&format!(
                "require_texture_state called for untracked texture id {}",
                id
            ));
            return;
        };

        if ts.permanent {
            if ts.uniform_state() != Some(state) {
                self.messages.warning(&format!(
                    "texture id {} has a permanent state; transition to {:?} ignored",
                    id, state
                ));
            }
            return;
        }

        let (base_mip, mips, base_slice, slices) =
            resolve_set(subresources, ts.mip_levels, ts.array_size);
        let covers_everything =
            base_mip == 0 && mips == ts.mip_levels && base_slice == 0 && slices == ts.array_size;

        // Whole-texture fast path: one barrier record when every subresource
        // agrees on its current state.
        if covers_everything {
            if let Some(current) = ts.uniform_state() {
                let uav_to_uav = current == state
                    && state.contains(ResourceStates::UNORDERED_ACCESS)
                    && ts.enable_uav_barriers
                    && !ts.first_uav_barrier_placed;
                if current != state || uav_to_uav {
                    self.texture_barriers.push(TextureBarrier {
                        id,
                        entire_texture: true,
                        mip_level: 0,
                        array_slice: 0,
                        before: current,
                        after: state,
                    });
                    ts.first_uav_barrier_placed = uav_to_uav;
                }
                ts.subresource_states.fill(state);
                return;
            }
        }

        let mut any_transition = false;
        for slice in base_slice..base_slice + slices {
            for mip in base_mip..base_mip + mips {
                let idx = ts.subresource_index(mip, slice);
                let current = ts.subresource_states[idx];
                let uav_to_uav = current == state
                    && state.contains(ResourceStates::UNORDERED_ACCESS)
                    && ts.enable_uav_barriers
                    && !ts.first_uav_barrier_placed;
                if current != state || uav_to_uav {
                    self.texture_barriers.push(TextureBarrier {
                        id,
                        entire_texture: false,
                        mip_level: mip,
                        array_slice: slice,
                        before: current,
                        after: state,
                    });
                    any_transition |= current != state;
                }
                ts.subresource_states[idx] = state;
            }
        }
        if any_transition {
            ts.first_uav_barrier_placed = false;
        }
    }

    pub fn require_buffer_state(&mut self, id: TrackingId, state: ResourceStates) {
        let Some(bs) = self.buffers.get_mut(&id) else {
            self.messages.warning(&format!(
                "require_buffer_state called for untracked buffer id {}",
                id
            ));
            return;
        };

        if bs.permanent {
            if bs.state != state {
                self.messages.warning(&format!(
                    "buffer id {} has a permanent state; transition to {:?} ignored",
                    id, state
                ));
            }
            return;
        }

        let uav_to_uav = bs.state == state
            && state.contains(ResourceStates::UNORDERED_ACCESS)
            && bs.enable_uav_barriers
            && !bs.first_uav_barrier_placed;
        if bs.state != state || uav_to_uav {
            self.buffer_barriers.push(BufferBarrier {
                id,
                before: bs.state,
                after: state,
            });
            bs.first_uav_barrier_placed = uav_to_uav;
        }
        bs.state = state;
    }

    pub fn set_permanent_texture_state(&mut self, id: TrackingId, state: ResourceStates) {
        self.require_texture_state(id, TextureSubresourceSet::all(), state);
        if let Some(ts) = self.textures.get_mut(&id) {
            ts.permanent = true;
        }
    }

    pub fn set_permanent_buffer_state(&mut self, id: TrackingId, state: ResourceStates) {
        self.require_buffer_state(id, state);
        if let Some(bs) = self.buffers.get_mut(&id) {
            bs.permanent = true;
        }
    }

    pub fn set_enable_uav_barriers_for_texture(&mut self, id: TrackingId, enable: bool) {
        if let Some(ts) = self.textures.get_mut(&id) {
            ts.enable_uav_barriers = enable;
            ts.first_uav_barrier_placed = false;
        }
    }

    pub fn set_enable_uav_barriers_for_buffer(&mut self, id: TrackingId, enable: bool) {
        if let Some(bs) = self.buffers.get_mut(&id) {
            bs.enable_uav_barriers = enable;
            bs.first_uav_barrier_placed = false;
        }
    }

    /// Appends transitions back to the declared initial state for every
    /// resource tracked with `keep_initial_state`. Called at command-list
    /// close.
    pub fn restore_initial_states(&mut self) {
        let texture_ids: Vec<(TrackingId, ResourceStates)> = self
            .textures
            .iter()
            .filter(|(_, ts)| ts.keep_initial_state && !ts.permanent)
            .map(|(id, ts)| (*id, ts.initial_state))
            .collect();
        for (id, initial) in texture_ids {
            self.require_texture_state(id, TextureSubresourceSet::all(), initial);
        }

        let buffer_ids: Vec<(TrackingId, ResourceStates)> = self
            .buffers
            .iter()
            .filter(|(_, bs)| bs.keep_initial_state && !bs.permanent)
            .map(|(id, bs)| (*id, bs.initial_state))
            .collect();
        for (id, initial) in buffer_ids {
            self.require_buffer_state(id, initial);
        }
    }

    pub fn texture_barriers(&self) -> &[TextureBarrier] {
        &self.texture_barriers
    }

    pub fn buffer_barriers(&self) -> &[BufferBarrier] {
        &self.buffer_barriers
    }

    pub fn has_pending_barriers(&self) -> bool {
        !self.texture_barriers.is_empty() || !self.buffer_barriers.is_empty()
    }

    pub fn clear_barriers(&mut self) {
        self.texture_barriers.clear();
        self.buffer_barriers.clear();
    }

    /// Forgets all tracked resources. Used when a command list is reused.
    pub fn reset(&mut self) {
        self.textures.clear();
        self.buffers.clear();
        self.clear_barriers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ResourceStateTracker {
        ResourceStateTracker::new(MessageSink::default())
    }

    #[test]
    fn repeated_require_emits_one_barrier() {
        let mut t = tracker();
        t.begin_tracking_texture(1, 4, 1, ResourceStates::COMMON, false);
        t.require_texture_state(1, TextureSubresourceSet::all(), ResourceStates::SHADER_RESOURCE);
        assert_eq!(t.texture_barriers().len(), 1);
        t.clear_barriers();
        t.require_texture_state(1, TextureSubresourceSet::all(), ResourceStates::SHADER_RESOURCE);
        assert!(t.texture_barriers().is_empty());
    }

    #[test]
    fn uav_to_uav_controlled_by_toggle() {
        let mut t = tracker();
        t.begin_tracking_buffer(7, ResourceStates::UNORDERED_ACCESS, false);

        t.set_enable_uav_barriers_for_buffer(7, false);
        t.require_buffer_state(7, ResourceStates::UNORDERED_ACCESS);
        assert!(t.buffer_barriers().is_empty());

        t.set_enable_uav_barriers_for_buffer(7, true);
        t.require_buffer_state(7, ResourceStates::UNORDERED_ACCESS);
        assert_eq!(t.buffer_barriers().len(), 1);
        assert_eq!(t.buffer_barriers()[0].before, ResourceStates::UNORDERED_ACCESS);
        assert_eq!(t.buffer_barriers()[0].after, ResourceStates::UNORDERED_ACCESS);
    }

    #[test]
    fn permanent_state_suppresses_transitions() {
        let mut t = tracker();
        t.begin_tracking_texture(3, 1, 1, ResourceStates::COPY_DEST, false);
        t.set_permanent_texture_state(3, ResourceStates::SHADER_RESOURCE);
        assert_eq!(t.texture_barriers().len(), 1);
        t.clear_barriers();

        // Mismatched request against a permanent state is a warning, not a
        // transition.
        t.require_texture_state(3, TextureSubresourceSet::all(), ResourceStates::RENDER_TARGET);
        assert!(t.texture_barriers().is_empty());
        assert_eq!(
            t.texture_subresource_state(3, 0, 0),
            Some(ResourceStates::SHADER_RESOURCE)
        );
    }

    #[test]
    fn set_texture_state_is_per_subresource_and_silent() {
        let mut t = tracker();
        t.begin_tracking_texture(11, 2, 2, ResourceStates::COMMON, false);
        t.set_texture_state(
            11,
            TextureSubresourceSet::single(1, 0),
            ResourceStates::RENDER_TARGET,
        );
        assert!(t.texture_barriers().is_empty());
        assert_eq!(
            t.texture_subresource_state(11, 1, 0),
            Some(ResourceStates::RENDER_TARGET)
        );
        // Only the named subresource is rewritten.
        assert_eq!(t.texture_subresource_state(11, 0, 0), Some(ResourceStates::COMMON));

        // A later require on that subresource transitions out of the
        // asserted state, not out of the texture's initial state.
        t.require_texture_state(
            11,
            TextureSubresourceSet::single(1, 0),
            ResourceStates::SHADER_RESOURCE,
        );
        assert_eq!(t.texture_barriers().len(), 1);
        assert_eq!(t.texture_barriers()[0].before, ResourceStates::RENDER_TARGET);
    }

    #[test]
    fn per_subresource_transitions() {
        let mut t = tracker();
        t.begin_tracking_texture(5, 2, 2, ResourceStates::COMMON, false);
        t.require_texture_state(
            5,
            TextureSubresourceSet::single(0, 1),
            ResourceStates::RENDER_TARGET,
        );
        assert_eq!(t.texture_barriers().len(), 1);
        assert!(!t.texture_barriers()[0].entire_texture);
        assert_eq!(t.texture_barriers()[0].mip_level, 0);
        assert_eq!(t.texture_barriers()[0].array_slice, 1);

        // The rest of the texture keeps its old state.
        assert_eq!(t.texture_subresource_state(5, 0, 0), Some(ResourceStates::COMMON));
        assert_eq!(
            t.texture_subresource_state(5, 0, 1),
            Some(ResourceStates::RENDER_TARGET)
        );

        // Whole-texture request now emits per-subresource barriers because
        // the states diverged.
        t.clear_barriers();
        t.require_texture_state(5, TextureSubresourceSet::all(), ResourceStates::SHADER_RESOURCE);
        assert_eq!(t.texture_barriers().len(), 4);
    }

    #[test]
    fn restore_initial_states_on_close() {
        let mut t = tracker();
        t.begin_tracking_buffer(9, ResourceStates::VERTEX_BUFFER, true);
        t.require_buffer_state(9, ResourceStates::COPY_DEST);
        t.clear_barriers();

        t.restore_initial_states();
        assert_eq!(t.buffer_barriers().len(), 1);
        assert_eq!(t.buffer_barriers()[0].after, ResourceStates::VERTEX_BUFFER);
    }
}
