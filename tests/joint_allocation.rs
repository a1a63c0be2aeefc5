//! Integration tests for joint allocation

use rawmem::adapters::{StatsTracker, TrackedAllocator};
use rawmem::joint::{clone_joint, JointAllocator, JointArray, JointClone, JointPtr};
use rawmem::lowlevel::HeapAllocator;

/// An object embedding a string and a fixed array, all in one block
struct Record {
    name: JointArray<u8>,
    values: JointArray<i32>,
}

impl Record {
    fn build(alloc: &JointAllocator<'_>, name: &str, values: &[i32]) -> Self {
        Self {
            name: JointArray::from_slice(alloc, name.as_bytes()).expect("name allocation failed"),
            values: JointArray::from_slice(alloc, values).expect("values allocation failed"),
        }
    }

    fn name(&self) -> &str {
        std::str::from_utf8(self.name.as_slice()).expect("name is valid utf-8")
    }
}

impl JointClone for Record {
    fn clone_joint(&self, alloc: &JointAllocator<'_>) -> Self {
        Self {
            name: JointArray::from_slice(alloc, &self.name).expect("name clone failed"),
            values: JointArray::from_slice(alloc, &self.values).expect("values clone failed"),
        }
    }
}

#[test]
fn one_allocation_serves_object_and_members() {
    let stats = StatsTracker::new();
    let alloc = TrackedAllocator::new(HeapAllocator::new(), &stats);

    // Room for 20 name bytes, 10 ints, and some alignment slack.
    let additional = 20 + 10 * core::mem::size_of::<i32>() + 10;
    let joint = JointPtr::new(alloc, additional, |j| {
        Record::build(j, "jointly allocated", &[1, 2, 3, 4, 5])
    })
    .expect("joint construction failed");

    assert_eq!(joint.name(), "jointly allocated");
    assert_eq!(joint.values.as_slice(), &[1, 2, 3, 4, 5]);

    // Exactly one raw allocation happened.
    assert_eq!(stats.snapshot().node_allocations, 1);
    assert_eq!(stats.snapshot().array_allocations, 0);

    drop(joint);
    assert_eq!(stats.snapshot().outstanding(), 0);
}

#[test]
fn clone_preserves_contents_within_source_budget() {
    let source = JointPtr::new(HeapAllocator::new(), 256, |j| {
        Record::build(j, "original", &[10, 20, 30, 40, 50])
    })
    .expect("joint construction failed");
    let used = source.capacity_used();

    let copy = clone_joint(&source, HeapAllocator::new()).expect("clone failed");
    assert_eq!(copy.name(), source.name());
    assert_eq!(copy.values.as_slice(), source.values.as_slice());

    // The clone is sized to the source's usage, never larger.
    assert_eq!(copy.capacity_used(), used);
    assert_eq!(copy.capacity_left(), 0);
    assert!(copy.capacity_used() + copy.capacity_left() <= 256);
}

#[test]
fn drop_runs_element_destructors() {
    use std::rc::Rc;

    let witness = Rc::new(());
    let joint = JointPtr::new(HeapAllocator::new(), 256, |j| {
        JointArray::from_fn(j, 5, |_| Rc::clone(&witness)).expect("array allocation failed")
    })
    .expect("joint construction failed");

    assert_eq!(Rc::strong_count(&witness), 6);
    drop(joint);
    assert_eq!(Rc::strong_count(&witness), 1);
}

#[test]
fn mutation_through_the_pointer() {
    let mut joint = JointPtr::new(HeapAllocator::new(), 64, |j| {
        JointArray::from_fn(j, 4, |i| i as i32).expect("array allocation failed")
    })
    .expect("joint construction failed");

    joint.as_mut_slice()[2] = 99;
    assert_eq!(joint.as_slice(), &[0, 1, 99, 3]);
}
