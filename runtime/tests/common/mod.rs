#![allow(dead_code)]

use tensorstream_runtime::{
    DType,
    Device,
    DeviceDescriptor,
    TensorHandle,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn device() -> Device {
    init_logger();
    Device::new(&DeviceDescriptor::default())
}

pub fn tensor_from_bytes(
    device: &Device,
    dtype: DType,
    dims: &[u64],
    bytes: &[u8],
) -> TensorHandle {
    let (handle, _) = device.allocate_tensor(dtype, dims);
    device
        .initialize_tensor(handle, |dst| dst.copy_from_slice(bytes))
        .unwrap();
    handle
}

pub fn tensor_f32(device: &Device, values: &[f32]) -> TensorHandle {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    tensor_from_bytes(device, DType::F32, &[values.len() as u64], &bytes)
}

pub fn tensor_i8(device: &Device, values: &[i8]) -> TensorHandle {
    let bytes: Vec<u8> = values.iter().map(|&v| v as u8).collect();
    tensor_from_bytes(device, DType::I8, &[values.len() as u64], &bytes)
}

pub fn tensor_u8(device: &Device, values: &[u8]) -> TensorHandle {
    tensor_from_bytes(device, DType::U8, &[values.len() as u64], values)
}

pub fn tensor_i32(device: &Device, values: &[i32]) -> TensorHandle {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    tensor_from_bytes(device, DType::I32, &[values.len() as u64], &bytes)
}

pub fn tensor_i64(device: &Device, values: &[i64]) -> TensorHandle {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    tensor_from_bytes(device, DType::I64, &[values.len() as u64], &bytes)
}

pub fn tensor_u64(device: &Device, values: &[u64]) -> TensorHandle {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    tensor_from_bytes(device, DType::U64, &[values.len() as u64], &bytes)
}

pub fn tensor_bool(device: &Device, values: &[bool]) -> TensorHandle {
    let bytes: Vec<u8> = values.iter().map(|&v| v as u8).collect();
    tensor_from_bytes(device, DType::Bool, &[values.len() as u64], &bytes)
}

pub fn read_bytes(device: &Device, handle: TensorHandle) -> Vec<u8> {
    let mut out = Vec::new();
    device
        .read_tensor(handle, false, |bytes| out.extend_from_slice(bytes))
        .unwrap();
    out
}

pub fn read_f32(device: &Device, handle: TensorHandle) -> Vec<f32> {
    read_bytes(device, handle)
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

pub fn read_i8(device: &Device, handle: TensorHandle) -> Vec<i8> {
    read_bytes(device, handle).iter().map(|&b| b as i8).collect()
}

pub fn read_i32(device: &Device, handle: TensorHandle) -> Vec<i32> {
    read_bytes(device, handle)
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

pub fn read_i64(device: &Device, handle: TensorHandle) -> Vec<i64> {
    read_bytes(device, handle)
        .chunks_exact(8)
        .map(|chunk| i64::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

pub fn unary(device: &Device, name: &str, input: TensorHandle) -> TensorHandle {
    device.execute_operation(name, &[], &[input]).unwrap().0
}

pub fn binary(device: &Device, name: &str, a: TensorHandle, b: TensorHandle) -> TensorHandle {
    device.execute_operation(name, &[], &[a, b]).unwrap().0
}

pub fn cast(device: &Device, input: TensorHandle, target: DType) -> TensorHandle {
    device
        .execute_operation("cast", &[target.code()], &[input])
        .unwrap()
        .0
}
