//! Auto allocator: scenario-driven composition of the stack.
//!
//! A scenario picks a two-level stack: an inner storage allocator and an
//! optional dedup layer on top. Every operation delegates to the
//! outermost layer; teardown runs outer first (the dedup index points
//! into parent storage).

use std::ptr::NonNull;

use super::dedup::{DedupAllocator, DedupConfig};
use super::linear::{LinearAllocator, LinearConfig};
use super::malloc::MallocAllocator;
use super::mremap::{MremapAllocator, MremapConfig};
use super::{
    AllocError, AllocTag, Area, SingleArea, TagAllocator, TagConfig, TagInfo,
};

/// Storage scenarios, named for their lifetime/internment shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoScenario {
    /// Arena chains, whole tags freed at once.
    #[default]
    PerTagFree,
    /// Arena chains with content internment.
    PerTagFreeDedup,
    /// Individually freeable objects.
    PerObjFree,
    /// Individually freeable objects with content internment.
    PerObjFreeDedup,
    /// One pre-sized buffer, exportable as a single area.
    SingleLinear,
    /// One pre-sized buffer with content internment.
    SingleLinearDedup,
}

impl AutoScenario {
    fn wants_dedup(self) -> bool {
        matches!(
            self,
            AutoScenario::PerTagFreeDedup
                | AutoScenario::PerObjFreeDedup
                | AutoScenario::SingleLinearDedup
        )
    }
}

#[derive(Debug, Clone)]
pub struct AutoConfig {
    pub scenario: AutoScenario,
    /// Expected total size; sizes the first arena, the linear buffer and
    /// the dedup tables.
    pub estimated_max_size: usize,
}

impl Default for AutoConfig {
    fn default() -> Self {
        AutoConfig {
            scenario: AutoScenario::default(),
            estimated_max_size: 1 << 20,
        }
    }
}

pub struct AutoAllocator {
    scenario: AutoScenario,
    outer: Box<dyn TagAllocator>,
}

impl AutoAllocator {
    pub fn new(config: AutoConfig) -> Result<Self, AllocError> {
        let est = config.estimated_max_size.max(4096);
        let inner: Box<dyn TagAllocator> = match config.scenario {
            AutoScenario::PerTagFree | AutoScenario::PerTagFreeDedup => {
                Box::new(MremapAllocator::new(MremapConfig {
                    min_arena: est.min(16 << 20),
                    ..Default::default()
                })?)
            }
            AutoScenario::PerObjFree | AutoScenario::PerObjFreeDedup => {
                Box::new(MallocAllocator::new())
            }
            AutoScenario::SingleLinear | AutoScenario::SingleLinearDedup => {
                Box::new(LinearAllocator::new(LinearConfig {
                    size: est,
                    ..Default::default()
                })?)
            }
        };
        let outer = if config.scenario.wants_dedup() {
            Box::new(DedupAllocator::new(inner, DedupConfig::sized_for(est))?)
        } else {
            inner
        };
        Ok(AutoAllocator {
            scenario: config.scenario,
            outer,
        })
    }

    pub fn scenario(&self) -> AutoScenario {
        self.scenario
    }
}

impl TagAllocator for AutoAllocator {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn get_tag(&self, config: &TagConfig) -> Result<AllocTag, AllocError> {
        self.outer.get_tag(config)
    }

    fn release_tag(&self, tag: AllocTag) {
        self.outer.release_tag(tag);
    }

    fn trim_tag(&self, tag: AllocTag) {
        self.outer.trim_tag(tag);
    }

    fn reset_tag(&self, tag: AllocTag) {
        self.outer.reset_tag(tag);
    }

    fn alloc(&self, tag: AllocTag, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.outer.alloc(tag, size, align)
    }

    fn free(&self, tag: AllocTag, ptr: NonNull<u8>) {
        self.outer.free(tag, ptr);
    }

    fn store(&self, tag: AllocTag, bytes: &[u8], align: usize) -> Option<NonNull<u8>> {
        self.outer.store(tag, bytes, align)
    }

    fn storev(&self, tag: AllocTag, iov: &[&[u8]], align: usize) -> Option<NonNull<u8>> {
        self.outer.storev(tag, iov, align)
    }

    fn release(&self, tag: AllocTag, ptr: NonNull<u8>, size: usize) {
        self.outer.release(tag, ptr, size);
    }

    fn contains(&self, tag: AllocTag, ptr: NonNull<u8>) -> bool {
        self.outer.contains(tag, ptr)
    }

    fn info(&self, tag: AllocTag) -> Option<TagInfo> {
        self.outer.info(tag)
    }

    fn single_area(&self, tag: AllocTag) -> Option<SingleArea> {
        self.outer.single_area(tag)
    }

    fn areas(&self, tag: AllocTag, out: &mut Vec<Area>) -> usize {
        self.outer.areas(tag, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_scenario_allocates() {
        for scenario in [
            AutoScenario::PerTagFree,
            AutoScenario::PerTagFreeDedup,
            AutoScenario::PerObjFree,
            AutoScenario::PerObjFreeDedup,
            AutoScenario::SingleLinear,
            AutoScenario::SingleLinearDedup,
        ] {
            let a = AutoAllocator::new(AutoConfig {
                scenario,
                estimated_max_size: 64 * 1024,
            })
            .unwrap();
            let tag = a.get_tag(&TagConfig::default()).unwrap();
            let p = a.store(tag, b"auto scenario smoke", 8).unwrap();
            assert!(a.contains(tag, p), "{scenario:?}");
            a.release_tag(tag);
        }
    }

    #[test]
    fn test_dedup_scenarios_intern() {
        let a = AutoAllocator::new(AutoConfig {
            scenario: AutoScenario::PerTagFreeDedup,
            estimated_max_size: 64 * 1024,
        })
        .unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let p1 = a.store(tag, b"same bytes both times", 8).unwrap();
        let p2 = a.store(tag, b"same bytes both times", 8).unwrap();
        assert_eq!(p1, p2);
        a.release_tag(tag);
    }

    #[test]
    fn test_single_linear_exports_one_area() {
        let a = AutoAllocator::new(AutoConfig {
            scenario: AutoScenario::SingleLinear,
            estimated_max_size: 64 * 1024,
        })
        .unwrap();
        let tag = a
            .get_tag(&TagConfig {
                reserve: 64,
                ..Default::default()
            })
            .unwrap();
        a.store(tag, b"exported", 8).unwrap();
        let area = a.single_area(tag).expect("linear tag is one mapping");
        assert_eq!(area.start_offset, 64);
        assert!(area.size > 64);
        // Arena-chain scenarios cannot promise a single area.
        let b = AutoAllocator::new(AutoConfig::default()).unwrap();
        let bt = b.get_tag(&TagConfig::default()).unwrap();
        b.store(bt, b"multi", 8).unwrap();
        assert!(b.single_area(bt).is_none());
    }
}
