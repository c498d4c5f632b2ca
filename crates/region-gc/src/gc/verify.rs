//! Heap verification.
//!
//! Walks every object of every region that may hold objects and checks that
//! its state word is settled and that each reference lands in a region that
//! still holds objects. Must run while no mutator allocates or stores.

use crate::error::VerifyError;
use crate::model::ObjectModel;
use crate::object::{ForwardState, ObjectRef};
use crate::region::{RegionDesc, RegionManager, RegionType};

/// Summary of a successful verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Regions walked.
    pub regions: usize,
    /// Objects checked.
    pub objects: usize,
    /// Non-null references checked.
    pub references: usize,
}

/// Verifies the whole heap.
///
/// # Errors
///
/// Returns the first violation found.
pub fn verify_heap(manager: &RegionManager, model: &dyn ObjectModel) -> Result<VerifyReport, VerifyError> {
    let mut report = VerifyReport::default();
    for id in manager.live_regions() {
        let region = manager.region(id);
        if region.region_type() == RegionType::From {
            continue;
        }
        report.regions += 1;
        verify_region(manager, model, region, &mut report)?;
    }
    tracing::debug!(?report, "heap verified");
    Ok(report)
}

fn verify_region(
    manager: &RegionManager,
    model: &dyn ObjectModel,
    region: &RegionDesc,
    report: &mut VerifyReport,
) -> Result<(), VerifyError> {
    let mut cursor = region.start();
    let limit = region.alloc_ptr();
    while cursor < limit {
        let Some(obj) = ObjectRef::from_address(cursor) else {
            break;
        };
        // SAFETY: addresses below the cursor hold initialized objects.
        let word = unsafe { obj.state() }.load();
        if word.is_filler() {
            let size = usize::try_from(word.payload()).unwrap_or(0);
            check_size(region, cursor, size)?;
            cursor += size;
            continue;
        }
        match word.forward_state() {
            ForwardState::Normal => {}
            state => {
                return Err(VerifyError::StaleForwardState {
                    object: cursor,
                    state: state.name(),
                });
            }
        }
        if !model.is_valid_object(obj) {
            return Err(VerifyError::InvalidObject { object: cursor });
        }
        let size = model.object_size(obj);
        check_size(region, cursor, size)?;
        verify_references(manager, model, obj, report)?;
        report.objects += 1;
        cursor += size;
    }
    Ok(())
}

fn check_size(region: &RegionDesc, object: usize, size: usize) -> Result<(), VerifyError> {
    if size == 0 || object + size > region.end() {
        return Err(VerifyError::BadSize { object, size });
    }
    Ok(())
}

fn verify_references(
    manager: &RegionManager,
    model: &dyn ObjectModel,
    obj: ObjectRef,
    report: &mut VerifyReport,
) -> Result<(), VerifyError> {
    let mut result = Ok(());
    model.for_each_reference(obj, &mut |field| {
        if result.is_err() {
            return;
        }
        let Some(target) = field.load().target() else {
            return;
        };
        report.references += 1;
        result = verify_target(manager, obj, target);
    });
    result
}

/// Checks that a reference held by `holder` points at a live region.
///
/// # Errors
///
/// [`VerifyError::OutsideHeap`] or [`VerifyError::DeadRegion`].
pub fn verify_target(manager: &RegionManager, holder: ObjectRef, target: ObjectRef) -> Result<(), VerifyError> {
    let Some(region) = manager.table().region_of_object(target) else {
        return Err(VerifyError::OutsideHeap {
            holder: holder.address(),
            target: target.address(),
        });
    };
    let region_type = region.region_type();
    if region_type.is_dead() || region_type == RegionType::From {
        return Err(VerifyError::DeadRegion {
            holder: holder.address(),
            target: target.address(),
            region: region_type.name(),
        });
    }
    Ok(())
}
