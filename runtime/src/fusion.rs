//! Turns the pending operation queue into a minimal list of fused
//! instructions.
//!
//! A fusion accumulates ops while each one consumes the previous result and
//! that result is invisible to everyone else (its only references are the
//! producing and consuming queue entries). Register pressure, dtype-group
//! switches, element-count changes and externally referenced intermediates
//! all close the current fusion and start a new one.

use smallvec::SmallVec;
use tensorstream_core::dtype::{
    DType,
    DtypeGroup,
};
use tensorstream_core::isa::RegisterSwap;

use super::stream::{
    PendingItem,
    PendingOp,
};
use super::table::{
    AllocationId,
    AllocationTable,
};

/// Metadata slots are addressed by a 16 bit index in the dispatch.
const MAX_METADATA_SLOTS: usize = u16::MAX as usize;

pub(crate) struct ElementwiseInstruction {
    pub inputs: SmallVec<[AllocationId; 4]>,
    pub output: AllocationId,
    pub opcodes: Vec<u16>,
    pub metadata: Vec<u8>,
    pub group: DtypeGroup,
    pub element_count: u64,
    pub write_dtype: DType,
}

pub(crate) enum Instruction {
    Elementwise(ElementwiseInstruction),
    Copy {
        src: AllocationId,
        dst: AllocationId,
    },
}

/// What a virtual register holds at the current point of the chain.
/// `Load(j)` is whatever input position `j` reads at dispatch start;
/// positions beyond the registered inputs are merely not assigned yet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RegSlot {
    Load(usize),
    Result,
    Stale,
}

struct FusionBuilder {
    inputs: SmallVec<[AllocationId; 4]>,
    regs: [RegSlot; 4],
    opcodes: Vec<u16>,
    metadata: Vec<u8>,
    metadata_slots: usize,
    group: DtypeGroup,
    element_count: u64,
    output: AllocationId,
    write_dtype: DType,
}

impl FusionBuilder {
    fn new(op: &PendingOp) -> Self {
        let mut builder = Self {
            inputs: SmallVec::new(),
            regs: [
                RegSlot::Load(0),
                RegSlot::Load(1),
                RegSlot::Load(2),
                RegSlot::Load(3),
            ],
            opcodes: Vec::new(),
            metadata: Vec::new(),
            metadata_slots: 0,
            group: op.group,
            element_count: op.element_count,
            output: op.output,
            write_dtype: op.out_dtype,
        };

        // Operands load straight into their registers: the primary operand
        // at position 0, the rest in order. Duplicate operands get their own
        // load position each.
        builder.inputs.push(op.inputs[op.primary_input]);
        for (index, &input) in op.inputs.iter().enumerate() {
            if index != op.primary_input {
                builder.inputs.push(input);
            }
        }
        assert!(
            builder.inputs.len() <= op.group.max_instruction_inputs(),
            "operation has more operands than the {:?} variant has input slots",
            op.group
        );

        builder.emit(op);
        builder
    }

    fn emit(&mut self, op: &PendingOp) {
        debug_assert!(op.op.group().map_or(true, |group| group == self.group));
        self.opcodes.push(op.op.encode());
        if let Some(metadata) = op.metadata {
            debug_assert!(op.op.has_metadata());
            self.metadata.extend_from_slice(&metadata.0);
            self.metadata_slots += 1;
        }
        for slot in self.regs.iter_mut().skip(1) {
            if *slot == RegSlot::Result {
                *slot = RegSlot::Stale;
            }
        }
        self.regs[0] = RegSlot::Result;
        self.output = op.output;
        self.write_dtype = op.out_dtype;
    }

    /// Attempts to fuse `op` onto the chain; on failure the builder is
    /// untouched and the caller closes the instruction.
    fn try_join(&mut self, op: &PendingOp, table: &AllocationTable) -> bool {
        if op.group != self.group || op.element_count != self.element_count {
            return false;
        }
        if !op.inputs.contains(&self.output) {
            // A single write per instruction: an op that ignores the running
            // result would fork the chain.
            return false;
        }
        // The intermediate must be invisible outside the chain: exactly the
        // producer's and this consumer's references.
        if table.get(self.output).reference_count != 2 {
            return false;
        }

        // Plan the operand placement without mutating.
        let mut plan: SmallVec<[RegSlot; 3]> = SmallVec::new();
        let mut new_loads: SmallVec<[AllocationId; 3]> = SmallVec::new();
        let operand_order = {
            let mut order: SmallVec<[AllocationId; 3]> = SmallVec::new();
            order.push(op.inputs[op.primary_input]);
            for (index, &input) in op.inputs.iter().enumerate() {
                if index != op.primary_input {
                    order.push(input);
                }
            }
            order
        };

        for &operand in &operand_order {
            if operand == self.output {
                if plan.contains(&RegSlot::Result) {
                    // The result lives in one register; it cannot feed two
                    // operand slots of the same op.
                    return false;
                }
                plan.push(RegSlot::Result);
                continue;
            }

            let existing = (0..self.inputs.len())
                .find(|&j| {
                    self.inputs[j] == operand
                        && !plan.contains(&RegSlot::Load(j))
                        && self.regs.contains(&RegSlot::Load(j))
                })
                .map(RegSlot::Load);
            match existing {
                Some(slot) => plan.push(slot),
                None => {
                    let position = self.inputs.len() + new_loads.len();
                    if position >= self.group.max_instruction_inputs() {
                        return false;
                    }
                    if !self.regs.contains(&RegSlot::Load(position)) {
                        // The register that would carry this load was
                        // already overwritten earlier in the chain.
                        return false;
                    }
                    new_loads.push(operand);
                    plan.push(RegSlot::Load(position));
                }
            }
        }

        if self.metadata_slots + op.metadata.is_some() as usize > MAX_METADATA_SLOTS {
            return false;
        }

        // Commit: register the new loads, swap operands into position, emit.
        self.inputs.extend_from_slice(&new_loads);
        for (target, &want) in plan.iter().enumerate() {
            let current = self
                .regs
                .iter()
                .position(|&slot| slot == want)
                .expect("planned operand vanished from the register file");
            if current != target {
                self.opcodes
                    .push(RegisterSwap::for_indices(target, current) as u16);
                self.regs.swap(target, current);
            }
        }
        self.emit(op);
        true
    }

    fn finish(self) -> Instruction {
        assert!(!self.opcodes.is_empty());
        assert!(self.inputs.len() <= self.group.max_instruction_inputs());
        Instruction::Elementwise(ElementwiseInstruction {
            inputs: self.inputs,
            output: self.output,
            opcodes: self.opcodes,
            metadata: self.metadata,
            group: self.group,
            element_count: self.element_count,
            write_dtype: self.write_dtype,
        })
    }
}

/// Compiles the (already zombie-pruned) queue into instructions, in order.
/// Deterministic; every queued op lands in exactly one instruction.
pub(crate) fn compile(pending: &[PendingItem], table: &AllocationTable) -> Vec<Instruction> {
    let mut instructions = Vec::new();
    let mut builder: Option<FusionBuilder> = None;

    for item in pending {
        match item {
            PendingItem::Copy { src, dst } => {
                if let Some(done) = builder.take() {
                    instructions.push(done.finish());
                }
                instructions.push(Instruction::Copy {
                    src: *src,
                    dst: *dst,
                });
            }
            PendingItem::Op(op) => {
                if let Some(current) = builder.as_mut() {
                    if current.try_join(op, table) {
                        continue;
                    }
                    instructions.push(builder.take().unwrap().finish());
                }
                builder = Some(FusionBuilder::new(op));
            }
        }
    }
    if let Some(done) = builder {
        instructions.push(done.finish());
    }
    instructions
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;
    use tensorstream_core::isa::{
        BinaryOp,
        Op,
        UnaryOp,
    };

    use super::*;

    struct Harness {
        table: AllocationTable,
        pending: Vec<PendingItem>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                table: AllocationTable::new(),
                pending: Vec::new(),
            }
        }

        fn tensor(&mut self, elements: u64) -> AllocationId {
            self.table.allocate(DType::F32, &[elements]).unwrap()
        }

        /// Mirrors the appender: retains inputs and the output, enqueues.
        fn push(&mut self, op: Op, inputs: &[AllocationId], elements: u64) -> AllocationId {
            for &input in inputs {
                self.table.retain(input);
            }
            let output = self.table.allocate(DType::F32, &[elements]).unwrap();
            self.table.retain(output);
            self.pending.push(PendingItem::Op(PendingOp {
                op,
                metadata: None,
                group: DtypeGroup::Wide32,
                inputs: SmallVec::from_slice(inputs),
                output,
                out_dtype: DType::F32,
                primary_input: 0,
                element_count: elements,
            }));
            output
        }

        fn drop_handle(&mut self, id: AllocationId) {
            assert!(self.table.release(id).is_none());
        }

        fn compile(&self) -> Vec<Instruction> {
            compile(&self.pending, &self.table)
        }
    }

    fn elementwise(instruction: &Instruction) -> &ElementwiseInstruction {
        match instruction {
            Instruction::Elementwise(e) => e,
            Instruction::Copy { .. } => panic!("unexpected copy instruction"),
        }
    }

    #[test]
    fn unary_chain_fuses_into_one_instruction() {
        let mut h = Harness::new();
        let t = h.tensor(2);
        let mut value = t;
        for _ in 0..7 {
            let next = h.push(Op::Unary(UnaryOp::IncrementF32), &[value], 2);
            if value != t {
                h.drop_handle(value);
            }
            value = next;
        }
        let instructions = h.compile();
        assert_eq!(instructions.len(), 1);
        let fused = elementwise(&instructions[0]);
        assert_eq!(fused.opcodes.len(), 7);
        assert_eq!(fused.inputs.as_slice(), &[t]);
        assert_eq!(fused.output, value);
    }

    #[test]
    fn externally_held_intermediate_splits_the_chain() {
        let mut h = Harness::new();
        let t = h.tensor(2);
        let a1 = h.push(Op::Unary(UnaryOp::IncrementF32), &[t], 2);
        let a = h.push(Op::Unary(UnaryOp::IncrementF32), &[a1], 2);
        h.drop_handle(a1);
        // `a` stays live (the frontend reads it later), so negation cannot
        // fuse through it.
        let b = h.push(Op::Unary(UnaryOp::NegF32), &[a], 2);
        let _ = b;
        let instructions = h.compile();
        assert_eq!(instructions.len(), 2);
        assert_eq!(elementwise(&instructions[0]).opcodes.len(), 2);
        assert_eq!(elementwise(&instructions[0]).output, a);
        assert_eq!(elementwise(&instructions[1]).opcodes.len(), 1);
    }

    #[test]
    fn binary_operand_registers_as_second_input() {
        let mut h = Harness::new();
        let a = h.tensor(4);
        let b = h.tensor(4);
        let sum = h.push(Op::Binary(BinaryOp::AddF32), &[a, b], 4);
        let c = h.tensor(4);
        let out = h.push(Op::Binary(BinaryOp::MulF32), &[sum, c], 4);
        h.drop_handle(sum);
        let _ = out;

        let instructions = h.compile();
        assert_eq!(instructions.len(), 1);
        let fused = elementwise(&instructions[0]);
        assert_eq!(fused.inputs.as_slice(), &[a, b, c]);
        // add, then a swap bringing c into register 2, then mul.
        assert_eq!(
            fused.opcodes,
            vec![
                BinaryOp::AddF32 as u16,
                RegisterSwap::Swap23 as u16,
                BinaryOp::MulF32 as u16,
            ]
        );
    }

    #[test]
    fn gradient_primary_operand_forces_a_swap() {
        let mut h = Harness::new();
        let x = h.tensor(4);
        let y = h.push(Op::Unary(UnaryOp::SquareF32), &[x], 4);
        let dy = h.tensor(4);
        // relu_grad(x = running result, dy): dy must end up in register 1.
        for &input in &[dy] {
            h.table.retain(input);
        }
        let output = h.table.allocate(DType::F32, &[4]).unwrap();
        h.table.retain(output);
        h.table.retain(y);
        h.pending.push(PendingItem::Op(PendingOp {
            op: Op::Binary(BinaryOp::ReluGradF32),
            metadata: None,
            group: DtypeGroup::Wide32,
            inputs: smallvec![y, dy],
            output,
            out_dtype: DType::F32,
            primary_input: 1,
            element_count: 4,
        }));
        h.drop_handle(y);

        let instructions = h.compile();
        assert_eq!(instructions.len(), 1);
        let fused = elementwise(&instructions[0]);
        assert_eq!(fused.inputs.as_slice(), &[x, dy]);
        assert_eq!(
            fused.opcodes,
            vec![
                UnaryOp::SquareF32 as u16,
                // dy (load position 1) into register 1, the result into 2.
                RegisterSwap::Swap12 as u16,
                BinaryOp::ReluGradF32 as u16,
            ]
        );
    }

    #[test]
    fn element_count_change_closes_the_fusion() {
        let mut h = Harness::new();
        let s = h.tensor(1);
        let s2 = h.push(Op::Unary(UnaryOp::IncrementF32), &[s], 1);
        let t = h.tensor(8);
        let out = h.push(Op::Binary(BinaryOp::AddF32), &[t, s2], 8);
        h.drop_handle(s2);
        let _ = out;

        let instructions = h.compile();
        assert_eq!(instructions.len(), 2);
        assert_eq!(elementwise(&instructions[0]).element_count, 1);
        assert_eq!(elementwise(&instructions[1]).element_count, 8);
    }

    #[test]
    fn wide64_variant_caps_inputs_at_three() {
        let mut h = Harness::new();
        let a = h.table.allocate(DType::I64, &[4]).unwrap();
        let push64 = |h: &mut Harness, op: Op, inputs: &[AllocationId]| {
            for &input in inputs {
                h.table.retain(input);
            }
            let output = h.table.allocate(DType::I64, &[4]).unwrap();
            h.table.retain(output);
            h.pending.push(PendingItem::Op(PendingOp {
                op,
                metadata: None,
                group: DtypeGroup::Wide64,
                inputs: SmallVec::from_slice(inputs),
                output,
                out_dtype: DType::I64,
                primary_input: 0,
                element_count: 4,
            }));
            output
        };

        let mut value = push64(&mut h, Op::Unary(UnaryOp::SquareI64), &[a]);
        for _ in 0..3 {
            let operand = h.table.allocate(DType::I64, &[4]).unwrap();
            let next = push64(&mut h, Op::Binary(BinaryOp::AddI64), &[value, operand]);
            h.drop_handle(value);
            value = next;
        }
        let instructions = h.compile();
        // square + two adds exhaust the three input slots; the third add
        // opens a new instruction.
        assert_eq!(instructions.len(), 2);
        assert_eq!(elementwise(&instructions[0]).inputs.len(), 3);
        assert!(elementwise(&instructions[0]).inputs.len() <= DtypeGroup::Wide64.max_instruction_inputs());
    }

    #[test]
    fn register_pressure_closes_the_fusion() {
        let mut h = Harness::new();
        let a = h.tensor(4);
        let mut value = h.push(Op::Unary(UnaryOp::SquareF32), &[a], 4);
        let mut extra = Vec::new();
        for _ in 0..4 {
            let operand = h.tensor(4);
            extra.push(operand);
            let next = h.push(Op::Binary(BinaryOp::AddF32), &[value, operand], 4);
            h.drop_handle(value);
            value = next;
        }
        let instructions = h.compile();
        // square + three adds fill the four input slots; the fourth add
        // starts a second instruction.
        assert_eq!(instructions.len(), 2);
        assert_eq!(elementwise(&instructions[0]).inputs.len(), 4);
    }
}
