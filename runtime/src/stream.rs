use log::trace;
use smallvec::SmallVec;
use tensorstream_core::dtype::{
    DType,
    DtypeGroup,
};
use tensorstream_core::isa::{
    Op,
    OpMetadata,
};

use super::heap::HeapAllocator;
use super::table::{
    AllocationId,
    AllocationTable,
};

/// Operations accumulated per batch before a flush is forced.
pub(crate) const MAX_COMMANDS_PER_BATCH: usize = 128;

/// One enqueued elementwise operation. It owns one reference on its output
/// and one per input occurrence; those move to the batch at encode time.
pub(crate) struct PendingOp {
    pub op: Op,
    pub metadata: Option<OpMetadata>,
    pub group: DtypeGroup,
    pub inputs: SmallVec<[AllocationId; 3]>,
    pub output: AllocationId,
    pub out_dtype: DType,
    pub primary_input: usize,
    pub element_count: u64,
}

pub(crate) enum PendingItem {
    Op(PendingOp),
    Copy {
        src: AllocationId,
        dst: AllocationId,
    },
}

/// The lazy queue between the appender and the fusion compiler.
pub(crate) struct CommandStream {
    pending: Vec<PendingItem>,
    max_commands: usize,
}

impl CommandStream {
    pub fn new(max_commands: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_commands,
        }
    }

    /// Enqueues and reports whether the queue hit its batch limit.
    pub fn push(&mut self, item: PendingItem) -> bool {
        self.pending.push(item);
        self.pending.len() >= self.max_commands
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn take_pending(&mut self) -> Vec<PendingItem> {
        std::mem::take(&mut self.pending)
    }

    /// True when `id` is the output of a queued operation or copy.
    pub fn writes_to(&self, id: AllocationId) -> bool {
        self.pending.iter().any(|item| match item {
            PendingItem::Op(op) => op.output == id,
            PendingItem::Copy { dst, .. } => *dst == id,
        })
    }

    /// Drops queued operations whose results are provably dead: the output
    /// holds exactly one reference (the operation's own), so no handle and
    /// no later operation can observe it. Scanning backward lets a whole
    /// dead chain unwind in one pass, because dropping a consumer releases
    /// its inputs before the scan reaches their producers.
    pub fn prune_zombies(&mut self, table: &mut AllocationTable, heap: &mut HeapAllocator) {
        for index in (0..self.pending.len()).rev() {
            let zombie = match &self.pending[index] {
                PendingItem::Op(op) => table.get(op.output).reference_count == 1,
                PendingItem::Copy { .. } => false,
            };
            if !zombie {
                continue;
            }
            let item = self.pending.remove(index);
            if let PendingItem::Op(op) = item {
                trace!("Pruned zombie operation producing allocation #{}", op.output);
                if let Some(block) = table.release(op.output) {
                    heap.free(block);
                }
                for &input in &op.inputs {
                    if let Some(block) = table.release(input) {
                        heap.free(block);
                    }
                }
            }
        }
    }
}
