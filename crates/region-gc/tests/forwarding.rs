//! Evacuation races between collector threads and reference fixing.

use region_gc::gc::ForwardingTable;
use region_gc::object::UpdateOutcome;
use region_gc::region::{CopyBuffer, RegionManager, RegionType};
use region_gc::testing::SimpleObjectModel;
use region_gc::{HeapConfig, ObjectRef, RefField, RefValue};

fn manager() -> RegionManager {
    RegionManager::new(&HeapConfig::default().with_unit_size(4096).with_heap_size(64 * 4096)).unwrap()
}

fn from_objects(mgr: &RegionManager, model: &SimpleObjectModel, count: usize) -> Vec<ObjectRef> {
    let id = mgr.take_region(1, RegionType::From, true, false).unwrap();
    let region = mgr.region(id);
    let header = model.header(0, 24);
    let size = model.size_of(header);
    (0..count)
        .map(|i| {
            let obj = ObjectRef::from_address(region.alloc(size).unwrap()).unwrap();
            unsafe {
                obj.state().store(header.state_word());
                ((obj.address() + 8) as *mut u64).write(i as u64);
            }
            obj
        })
        .collect()
}

#[test]
fn test_each_object_copied_at_most_once() {
    let mgr = manager();
    let model = SimpleObjectModel::new();
    let table = ForwardingTable::new();
    let objs = from_objects(&mgr, &model, 100);

    let copies: Vec<Vec<ObjectRef>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let mut buffer = CopyBuffer::new();
                    let copies = objs
                        .iter()
                        .map(|&obj| table.forward(&mgr, &model, &mut buffer, obj))
                        .collect();
                    ForwardingTable::retire(&mgr, &mut buffer);
                    copies
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(copies.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(table.objects_copied(), objs.len());
    assert_eq!(model.moved(), objs.len());
    for (i, copy) in copies[0].iter().enumerate() {
        assert_eq!(unsafe { ((copy.address() + 8) as *const u64).read() }, i as u64);
        assert_eq!(table.get_forwarding_pointer(objs[i]), Some(*copy));
    }
}

#[test]
fn test_racing_field_updates_settle_once() {
    let mgr = manager();
    let model = SimpleObjectModel::new();
    let table = ForwardingTable::new();
    let obj = from_objects(&mgr, &model, 1)[0];
    let field = RefField::new(RefValue::strong(obj));
    let old = field.load();

    let outcomes: Vec<UpdateOutcome> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let mut buffer = CopyBuffer::new();
                    let copy = table.forward(&mgr, &model, &mut buffer, obj);
                    let outcome = field.update(old, old.with_target(copy));
                    ForwardingTable::retire(&mgr, &mut buffer);
                    outcome
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(outcomes.iter().all(|o| o.is_settled()));
    assert_eq!(outcomes.iter().filter(|&&o| o == UpdateOutcome::Updated).count(), 1);
    assert_eq!(field.load().target(), table.get_forwarding_pointer(obj));
}

#[test]
fn test_weak_bit_survives_update() {
    let mgr = manager();
    let model = SimpleObjectModel::new();
    let table = ForwardingTable::new();
    let obj = from_objects(&mgr, &model, 1)[0];
    let field = RefField::new(RefValue::weak(obj));

    let mut buffer = CopyBuffer::new();
    let copy = table.forward(&mgr, &model, &mut buffer, obj);
    let old = field.load();
    assert_eq!(field.update(old, old.with_target(copy)), UpdateOutcome::Updated);
    assert!(field.load().is_weak());
    assert_eq!(field.load().target(), Some(copy));
    ForwardingTable::retire(&mgr, &mut buffer);
}
