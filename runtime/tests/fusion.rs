//! End-to-end fusion behavior: chain coalescing, divergence, dtype-group
//! splits and submission-pattern independence.

mod common;

use common::*;
use tensorstream_runtime::{
    DType,
    Device,
    DeviceDescriptor,
};

#[test]
fn seven_increments_fuse_into_one_dispatch() {
    let device = device();
    let t = tensor_f32(&device, &[101.0, 101.0]);

    let mut value = t;
    for _ in 0..7 {
        let next = unary(&device, "increment", value);
        if value != t {
            device.release_tensor(value);
        }
        value = next;
    }

    assert_eq!(read_f32(&device, value), vec![108.0, 108.0]);
    assert_eq!(device.committed_batch_count(), 1);
    let stats = device.last_flush_stats().unwrap();
    assert_eq!(stats.pending_operations, 7);
    assert_eq!(stats.instructions, 1);
}

#[test]
fn divergent_chain_splits_at_the_shared_intermediate() {
    let device = device();
    let t = tensor_f32(&device, &[11.0, 11.0]);

    let a1 = unary(&device, "increment", t);
    let a = unary(&device, "increment", a1);
    device.release_tensor(a1);
    // The negation references `a`, which the frontend also still holds, so
    // the two increments and the negation cannot share registers.
    let b = unary(&device, "neg", a);

    assert_eq!(read_f32(&device, a), vec![13.0, 13.0]);
    assert_eq!(read_f32(&device, b), vec![-13.0, -13.0]);

    assert_eq!(device.committed_batch_count(), 1);
    let stats = device.last_flush_stats().unwrap();
    assert_eq!(stats.pending_operations, 3);
    assert_eq!(stats.instructions, 2);
}

#[test]
fn cross_group_cast_splits_into_three_instructions() {
    let device = device();
    let t = tensor_f32(&device, &[5.005, 5.005]);

    let squared = unary(&device, "square", t);
    let as_i64 = cast(&device, squared, DType::I64);
    device.release_tensor(squared);
    let back = cast(&device, as_i64, DType::F32);
    device.release_tensor(as_i64);
    let root = unary(&device, "sqrt", back);
    device.release_tensor(back);

    assert_eq!(read_f32(&device, root), vec![5.0, 5.0]);
    assert_eq!(device.committed_batch_count(), 1);
    let stats = device.last_flush_stats().unwrap();
    assert_eq!(stats.pending_operations, 4);
    // f32 square | 64-bit cast round trip | f32 sqrt.
    assert_eq!(stats.instructions, 3);
}

#[test]
fn broadcast_operand_fuses_with_following_ops() {
    let device = device();
    let t = tensor_f32(&device, &[1.0, 2.0, 3.0, 4.0]);
    let s = tensor_f32(&device, &[10.0]);

    let shifted = binary(&device, "add", t, s);
    let negated = unary(&device, "neg", shifted);
    device.release_tensor(shifted);

    assert_eq!(read_f32(&device, negated), vec![-11.0, -12.0, -13.0, -14.0]);
    let stats = device.last_flush_stats().unwrap();
    assert_eq!(stats.pending_operations, 2);
    assert_eq!(stats.instructions, 1);
}

fn run_chain(device: &Device, reads_between: bool) -> Vec<u8> {
    let t = tensor_f32(device, &[0.3, -1.7, 2.5, 100.0, -0.0, 0.5]);
    let names = ["square", "sigmoid", "increment", "softsign", "sqrt", "neg"];
    let mut value = t;
    for name in names {
        let next = unary(device, name, value);
        if value != t {
            device.release_tensor(value);
        }
        if reads_between {
            let _ = read_bytes(device, next);
        }
        value = next;
    }
    read_bytes(device, value)
}

#[test]
fn burst_and_incremental_submission_agree_bitwise() {
    let burst = run_chain(&device(), false);
    let incremental = run_chain(&device(), true);
    assert_eq!(burst, incremental);
}

#[test]
fn queue_limit_forces_intermediate_flushes() {
    init_logger();
    let device = Device::new(&DeviceDescriptor {
        max_commands_per_batch: 4,
        ..DeviceDescriptor::default()
    });
    let t = tensor_f32(&device, &[0.0, 1.0]);

    let mut value = t;
    for _ in 0..10 {
        let next = unary(&device, "increment", value);
        if value != t {
            device.release_tensor(value);
        }
        value = next;
    }
    // Two full batches went out while appending.
    assert_eq!(device.committed_batch_count(), 2);
    assert_eq!(device.queued_operation_count(), 2);

    assert_eq!(read_f32(&device, value), vec![10.0, 11.0]);
    assert_eq!(device.committed_batch_count(), 3);
}

#[test]
fn gradient_operand_order_is_respected_when_fused() {
    let device = device();
    let x = tensor_f32(&device, &[-1.0, 2.0, -3.0, 4.0]);
    let dy = tensor_f32(&device, &[10.0, 20.0, 30.0, 40.0]);

    // Chain a producer in front so relu_grad joins an open fusion and the
    // compiler has to swap dy into the primary register.
    let doubled = binary(&device, "add", x, x);
    let grad = device
        .execute_operation("relu_grad", &[], &[doubled, dy])
        .unwrap()
        .0;
    device.release_tensor(doubled);

    assert_eq!(read_f32(&device, grad), vec![0.0, 20.0, 0.0, 40.0]);
    let stats = device.last_flush_stats().unwrap();
    assert_eq!(stats.instructions, 1);
}
