//! Slot math and the bind/unbind diff that keeps backend descriptor traffic
//! to the minimum between consecutive pipeline states.

use crate::types::{BindingLayoutDesc, RegisterClass, ResourceType, REGISTER_CLASS_COUNT};
use smallvec::SmallVec;

/// Inclusive slot interval; `min > max` means no slots in the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub min: u32,
    pub max: u32,
}

impl SlotRange {
    pub const EMPTY: SlotRange = SlotRange { min: u32::MAX, max: 0 };

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn add(&mut self, slot: u32) {
        self.min = self.min.min(slot);
        self.max = self.max.max(slot);
    }

    pub fn covers(&self, other: &SlotRange) -> bool {
        self.min <= other.min && self.max >= other.max
    }
}

/// Per-register-class slot extents of one binding set, in the backend's flat
/// namespace (layout slots shifted by the layout's binding offsets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSlotRanges {
    ranges: [SlotRange; REGISTER_CLASS_COUNT],
}

impl Default for BindingSlotRanges {
    fn default() -> Self {
        Self {
            ranges: [SlotRange::EMPTY; REGISTER_CLASS_COUNT],
        }
    }
}

impl BindingSlotRanges {
    /// Computed once at binding-set creation.
    pub fn from_layout(layout: &BindingLayoutDesc) -> Self {
        let mut result = Self::default();
        for item in &layout.bindings {
            // Push constants live outside the slot namespace on every backend.
            if item.ty == ResourceType::PushConstants {
                continue;
            }
            let class = item.ty.register_class();
            let base = item.slot + layout.binding_offsets.offset_for(class);
            let range = &mut result.ranges[class.index()];
            range.add(base);
            if item.size > 1 {
                range.add(base + item.size - 1);
            }
        }
        result
    }

    pub fn class(&self, class: RegisterClass) -> &SlotRange {
        &self.ranges[class.index()]
    }

    /// True when every class `other` occupies is fully covered here.
    pub fn covers(&self, other: &BindingSlotRanges) -> bool {
        self.ranges
            .iter()
            .zip(other.ranges.iter())
            .all(|(mine, theirs)| theirs.is_empty() || (!mine.is_empty() && mine.covers(theirs)))
    }
}

/// What a backend needs to know about a bound set to diff it: a stable
/// identity and the slot extents.
pub trait DiffableBinding {
    fn identity(&self) -> usize;
    fn slot_ranges(&self) -> BindingSlotRanges;
}

/// Indices into the new and current binding arrays, after cancellation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BindingDiff {
    pub to_bind: SmallVec<[usize; 8]>,
    pub to_unbind: SmallVec<[usize; 8]>,
}

/// Computes the bind/unbind work between `current` and `new`.
///
/// Sets with the same identity at the same index produce no work. An unbind
/// whose slots are entirely covered by some surviving bind is dropped, since
/// the bind overwrites every descriptor the unbind would null out; that
/// shortcut is disabled when the framebuffer or the pipeline's stage mask
/// changed, because coverage then no longer implies the stale descriptor is
/// unreachable.
pub fn compute_binding_diff<T: DiffableBinding>(
    current: &[Option<T>],
    new: &[Option<T>],
    allow_covered_unbind_elision: bool,
) -> BindingDiff {
    let mut diff = BindingDiff::default();

    let len = current.len().max(new.len());
    for i in 0..len {
        let cur = current.get(i).and_then(|s| s.as_ref());
        let next = new.get(i).and_then(|s| s.as_ref());
        match (cur, next) {
            (Some(c), Some(n)) if c.identity() == n.identity() => {}
            (Some(_), Some(_)) => {
                diff.to_unbind.push(i);
                diff.to_bind.push(i);
            }
            (Some(_), None) => diff.to_unbind.push(i),
            (None, Some(_)) => diff.to_bind.push(i),
            (None, None) => {}
        }
    }

    if allow_covered_unbind_elision {
        diff.to_unbind.retain(|&mut unbind_index| {
            let unbound = current[unbind_index].as_ref().unwrap().slot_ranges();
            let covered = diff.to_bind.iter().any(|&bind_index| {
                new[bind_index]
                    .as_ref()
                    .unwrap()
                    .slot_ranges()
                    .covers(&unbound)
            });
            !covered
        });
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BindingLayoutItem, ShaderStageMask};

    struct Fake {
        id: usize,
        ranges: BindingSlotRanges,
    }

    impl DiffableBinding for Fake {
        fn identity(&self) -> usize {
            self.id
        }
        fn slot_ranges(&self) -> BindingSlotRanges {
            self.ranges
        }
    }

    fn fake(id: usize, srv: Option<(u32, u32)>, cb: Option<(u32, u32)>) -> Fake {
        let mut ranges = BindingSlotRanges::default();
        if let Some((min, max)) = srv {
            ranges.ranges[RegisterClass::ShaderResource.index()] = SlotRange { min, max };
        }
        if let Some((min, max)) = cb {
            ranges.ranges[RegisterClass::ConstantBuffer.index()] = SlotRange { min, max };
        }
        Fake { id, ranges }
    }

    #[test]
    fn slot_ranges_apply_binding_offsets() {
        let layout = BindingLayoutDesc {
            debug_name: String::new(),
            visibility: ShaderStageMask::all(),
            register_space: 0,
            register_space_is_descriptor_set: false,
            bindings: vec![
                BindingLayoutItem::texture_srv(2),
                BindingLayoutItem::texture_srv(5),
                BindingLayoutItem::constant_buffer(0),
                BindingLayoutItem::push_constants(1, 16),
            ],
            binding_offsets: Default::default(),
        };
        let ranges = BindingSlotRanges::from_layout(&layout);
        assert_eq!(*ranges.class(RegisterClass::ShaderResource), SlotRange { min: 2, max: 5 });
        assert_eq!(
            *ranges.class(RegisterClass::ConstantBuffer),
            SlotRange { min: 256, max: 256 }
        );
        assert!(ranges.class(RegisterClass::Sampler).is_empty());
    }

    #[test]
    fn identical_sets_produce_no_work() {
        let a = [Some(fake(1, Some((0, 3)), None))];
        let b = [Some(fake(1, Some((0, 3)), None))];
        let diff = compute_binding_diff(&a, &b, true);
        assert!(diff.to_bind.is_empty());
        assert!(diff.to_unbind.is_empty());
    }

    #[test]
    fn covered_unbind_is_elided() {
        // Old set occupies SRV 1..2; new set at another index covers 0..3.
        let current = [Some(fake(1, Some((1, 2)), None)), None];
        let new = [None, Some(fake(2, Some((0, 3)), None))];
        let diff = compute_binding_diff(&current, &new, true);
        assert_eq!(diff.to_bind.as_slice(), &[1]);
        assert!(diff.to_unbind.is_empty());
    }

    #[test]
    fn stage_mask_change_keeps_the_unbind() {
        let current = [Some(fake(1, Some((1, 2)), None)), None];
        let new = [None, Some(fake(2, Some((0, 3)), None))];
        let diff = compute_binding_diff(&current, &new, false);
        assert_eq!(diff.to_unbind.as_slice(), &[0]);
        assert_eq!(diff.to_bind.as_slice(), &[1]);
    }

    #[test]
    fn partial_coverage_keeps_the_unbind() {
        // Old set also occupies a constant-buffer slot the new set never touches.
        let current = [Some(fake(1, Some((1, 2)), Some((256, 256)))), None];
        let new = [None, Some(fake(2, Some((0, 3)), None))];
        let diff = compute_binding_diff(&current, &new, true);
        assert_eq!(diff.to_unbind.as_slice(), &[0]);
    }

    #[test]
    fn replaced_set_is_unbound_then_bound() {
        let current = [Some(fake(1, Some((0, 0)), None))];
        let new = [Some(fake(2, Some((4, 4)), None))];
        let diff = compute_binding_diff(&current, &new, true);
        assert_eq!(diff.to_unbind.as_slice(), &[0]);
        assert_eq!(diff.to_bind.as_slice(), &[0]);
    }
}
