use tensorstream_core::dtype::DtypeGroup;
use tensorstream_core::gpu::{
    Buffer,
    BufferBinding,
    BufferCopy,
    CommandBuffer,
    Dispatch,
};
use tensorstream_core::isa::{
    read_scalar32,
    read_scalar64,
    run_chain32,
    run_chain64,
    write_scalar32,
    write_scalar64,
    ReadParams,
};

use super::HostBackend;

pub(crate) enum HostCommand {
    Dispatch(Dispatch<HostBackend>),
    Copy(BufferCopy<HostBackend>),
}

pub struct HostCommandBuffer {
    pub(crate) commands: Vec<HostCommand>,
}

impl HostCommandBuffer {
    pub(crate) fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }
}

impl CommandBuffer<HostBackend> for HostCommandBuffer {
    unsafe fn encode_dispatch(&mut self, dispatch: Dispatch<HostBackend>) {
        debug_assert_eq!(
            dispatch.params.num_operations as usize,
            dispatch.opcodes.len()
        );
        self.commands.push(HostCommand::Dispatch(dispatch));
    }

    unsafe fn encode_copy(&mut self, copy: BufferCopy<HostBackend>) {
        self.commands.push(HostCommand::Copy(copy));
    }

    fn encoded_command_count(&self) -> usize {
        self.commands.len()
    }
}

unsafe fn input_slice<'a>(
    binding: &'a BufferBinding<HostBackend>,
    params: ReadParams,
    element_count: u64,
) -> &'a [u8] {
    let width = params.cast.element_width() as u64;
    let length = if params.is_broadcast() {
        width
    } else {
        width * element_count
    };
    let ptr = binding
        .buffer
        .map_unsafe(binding.offset, length, true)
        .expect("dispatch input binding out of bounds");
    std::slice::from_raw_parts(ptr, length as usize)
}

pub(crate) unsafe fn execute_dispatch(dispatch: &Dispatch<HostBackend>) {
    let params = &dispatch.params;
    let element_count = params.element_count;
    let num_inputs = params.num_inputs as usize;

    let out_width = params.write_params.cast.element_width() as u64;
    let out_length = out_width * element_count;
    let out_ptr = dispatch
        .output
        .buffer
        .map_unsafe(dispatch.output.offset, out_length, false)
        .expect("dispatch output binding out of bounds");
    let out = std::slice::from_raw_parts_mut(out_ptr, out_length as usize);

    let mut inputs: [&[u8]; 4] = [&[], &[], &[], &[]];
    for i in 0..num_inputs {
        inputs[i] = input_slice(&dispatch.inputs[i], params.read_params[i], element_count);
    }

    match params.group {
        DtypeGroup::Wide32 => {
            for element in 0..element_count as usize {
                let mut regs = [0u32; 4];
                for i in 0..num_inputs {
                    regs[i] = read_scalar32(inputs[i], element, params.read_params[i]);
                }
                run_chain32(&dispatch.opcodes, &dispatch.metadata, &mut regs);
                write_scalar32(out, element, params.write_params, regs[0]);
            }
        }
        DtypeGroup::Wide64 => {
            for element in 0..element_count as usize {
                let mut regs = [0u64; 4];
                for i in 0..num_inputs {
                    regs[i] = read_scalar64(inputs[i], element, params.read_params[i]);
                }
                run_chain64(&dispatch.opcodes, &dispatch.metadata, &mut regs);
                write_scalar64(out, element, params.write_params, regs[0]);
            }
        }
    }
}

pub(crate) unsafe fn execute_copy(copy: &BufferCopy<HostBackend>) {
    let src_ptr = copy
        .src
        .buffer
        .map_unsafe(copy.src.offset, copy.length, true)
        .expect("copy source binding out of bounds");
    let dst_ptr = copy
        .dst
        .buffer
        .map_unsafe(copy.dst.offset, copy.length, false)
        .expect("copy destination binding out of bounds");
    std::ptr::copy_nonoverlapping(src_ptr, dst_ptr, copy.length as usize);
}
