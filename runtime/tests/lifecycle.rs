//! Allocation lifetimes, zombie pruning, error kinds and storage modes.

mod common;

use common::*;
use tensorstream_runtime::{
    DType,
    Device,
    DeviceDescriptor,
    StorageMode,
    TensorError,
    TensorHandle,
};

#[test]
fn dead_chain_never_reaches_the_device() {
    let device = device();
    let t = tensor_f32(&device, &[8.0, 8.0]);

    let mut value = t;
    for _ in 0..4 {
        let next = unary(&device, "increment", value);
        if value != t {
            device.release_tensor(value);
        }
        value = next;
    }
    // Drop the end of the chain: every intermediate is now unreachable.
    device.release_tensor(value);

    device.barrier().unwrap();
    assert_eq!(device.committed_batch_count(), 0);
    assert_eq!(device.queued_operation_count(), 0);
    assert_eq!(read_f32(&device, t), vec![8.0, 8.0]);
    // Only the source tensor survived the pruning.
    assert_eq!(device.live_allocation_count(), 1);
}

#[test]
fn error_kinds_are_precise() {
    let device = device();

    let (uninitialized, _) = device.allocate_tensor(DType::F32, &[4]);
    assert_eq!(
        device.read_tensor(uninitialized, false, |_| {}),
        Err(TensorError::NotInitialized)
    );

    let t = tensor_f32(&device, &[1.0]);
    assert_eq!(
        device.initialize_tensor(t, |_| {}),
        Err(TensorError::AlreadyInitialized)
    );

    device.release_tensor(t);
    assert_eq!(
        device.read_tensor(t, false, |_| {}),
        Err(TensorError::Deallocated)
    );

    // An id above everything ever issued is distinguishable from a dead one.
    let forged = TensorHandle::from_raw(1 << 40);
    assert_eq!(
        device.read_tensor(forged, false, |_| {}),
        Err(TensorError::NeverAllocated)
    );

    let input = tensor_f32(&device, &[1.0, 2.0]);
    assert!(matches!(
        device.execute_operation("transmogrify", &[], &[input]),
        Err(TensorError::UnknownOp(_))
    ));

    // An operand nobody ever wrote has no backing buffer for the encoder
    // to bind; reading the same handle directly stays NotInitialized.
    let (blank, _) = device.allocate_tensor(DType::F32, &[2]);
    assert_eq!(
        device.execute_operation("increment", &[], &[blank]),
        Err(TensorError::NullBackingBuffer)
    );
    assert_eq!(
        device.execute_operation("copy", &[], &[blank]),
        Err(TensorError::NullBackingBuffer)
    );
    assert_eq!(
        device.read_tensor(blank, false, |_| {}),
        Err(TensorError::NotInitialized)
    );
}

#[test]
fn failed_operations_leave_the_table_unchanged() {
    let device = device();
    let t = tensor_f32(&device, &[1.0, 2.0]);
    let live_before = device.live_allocation_count();
    let queued_before = device.queued_operation_count();

    let _ = device.execute_operation("transmogrify", &[], &[t]);
    let _ = device.execute_operation("increment", &[], &[TensorHandle::from_raw(1 << 40)]);

    assert_eq!(device.live_allocation_count(), live_before);
    assert_eq!(device.queued_operation_count(), queued_before);
}

#[test]
#[should_panic(expected = "rank exceeds the supported maximum")]
fn rank_above_five_panics() {
    let device = device();
    device.allocate_tensor(DType::F32, &[1, 1, 1, 1, 1, 1]);
}

#[test]
fn shape_is_preserved_through_operations() {
    let device = device();
    let (t, rank) = device.allocate_tensor(DType::F32, &[2, 3]);
    assert_eq!(rank, 2);
    device
        .initialize_tensor(t, |bytes| bytes.fill(0))
        .unwrap();

    let (out, out_rank) = device.execute_operation("increment", &[], &[t]).unwrap();
    assert_eq!(out_rank, 2);
    let mut dims = [0u64; 5];
    assert_eq!(device.copy_tensor_shape(out, &mut dims).unwrap(), 2);
    assert_eq!(&dims[..2], &[2, 3]);
}

#[test]
fn deletion_waits_for_the_referencing_batch() {
    let device = device();
    let t = tensor_f32(&device, &[1.0, 2.0]);
    let out = unary(&device, "increment", t);
    // The queued operation still holds `t`; dropping the handle must not
    // free it out from under the batch.
    device.release_tensor(t);
    assert_eq!(device.live_allocation_count(), 2);

    assert_eq!(read_f32(&device, out), vec![2.0, 3.0]);
    // The batch completed and released the last reference.
    assert_eq!(device.live_allocation_count(), 1);
}

#[test]
fn private_storage_reads_stage_and_write_back() {
    init_logger();
    let device = Device::new(&DeviceDescriptor {
        storage_mode: StorageMode::Private,
        ..DeviceDescriptor::default()
    });
    let t = tensor_f32(&device, &[1.0, 2.0, 3.0, 4.0]);

    device
        .read_tensor(t, true, |bytes| {
            for (chunk, value) in bytes.chunks_exact_mut(4).zip([5.0f32, 6.0, 7.0, 8.0]) {
                chunk.copy_from_slice(&value.to_le_bytes());
            }
        })
        .unwrap();

    // The mutation went back to device memory and is visible to dispatches.
    assert_eq!(read_f32(&device, t), vec![5.0, 6.0, 7.0, 8.0]);
    let incremented = unary(&device, "increment", t);
    assert_eq!(read_f32(&device, incremented), vec![6.0, 7.0, 8.0, 9.0]);
}

#[test]
fn explicit_copy_snapshots_the_source() {
    let device = device();
    let t = tensor_f32(&device, &[1.0, 2.0]);
    let (snapshot, _) = device.execute_operation("copy", &[], &[t]).unwrap();
    // The copy is a synchronization edge: it flushed on its own.
    assert_eq!(device.committed_batch_count(), 1);

    device
        .read_tensor(t, true, |bytes| bytes.fill(0))
        .unwrap();
    assert_eq!(read_f32(&device, snapshot), vec![1.0, 2.0]);
    assert_eq!(read_f32(&device, t), vec![0.0, 0.0]);
}

#[test]
fn copy_of_a_pending_result_flushes_the_chain() {
    let device = device();
    let t = tensor_f32(&device, &[3.0, 4.0]);
    let incremented = unary(&device, "increment", t);
    let (snapshot, _) = device
        .execute_operation("copy", &[], &[incremented])
        .unwrap();
    assert_eq!(read_f32(&device, snapshot), vec![4.0, 5.0]);
}

#[test]
fn memory_pressure_recovers_by_draining_and_evicting() {
    init_logger();
    let device = Device::new(&DeviceDescriptor {
        memory_capacity: 32 << 20,
        max_buffer_length: 1 << 20,
        recommended_max_working_set_size: 64 << 10,
        ..DeviceDescriptor::default()
    });

    // Each tensor is 32 KiB; the recommended working set fits only two.
    let values: Vec<f32> = (0..8192).map(|i| i as f32).collect();
    let a = tensor_f32(&device, &values);
    let b = unary(&device, "increment", a);
    device.barrier().unwrap();
    let c = unary(&device, "increment", b);
    device.barrier().unwrap();
    let d = unary(&device, "increment", c);
    device.barrier().unwrap();

    let result = read_f32(&device, d);
    assert_eq!(result[0], 3.0);
    assert_eq!(result[8191], 8191.0 + 3.0);
}

#[test]
fn reference_count_survives_repeated_operations() {
    let device = device();
    let t = tensor_f32(&device, &[2.0, 3.0]);
    let mut outputs = Vec::new();
    for _ in 0..3 {
        outputs.push(unary(&device, "square", t));
    }
    for out in &outputs {
        assert_eq!(read_f32(&device, *out), vec![4.0, 9.0]);
    }
    for out in outputs {
        device.release_tensor(out);
    }
    device.barrier().unwrap();
    assert_eq!(device.live_allocation_count(), 1);
    assert_eq!(read_f32(&device, t), vec![2.0, 3.0]);
}
