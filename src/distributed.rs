//! Process-group abstraction for multi-process training.
//!
//! The engine never talks to a communication backend directly. Everything it
//! needs from the outside world is three collectives behind the
//! [`ProcessGroup`] trait: a barrier, a sum-reduction over a small scalar
//! buffer, and a rank-ordered tensor all-gather. Single-process runs use
//! [`SingleProcess`]; embedders with a real backend (NCCL, gloo, MPI) plug it
//! in through [`CallbackGroup`] without this crate linking against it.

use candle_core::Tensor;

use crate::error::TrainerResult;

/// Collectives the training engine requires from its environment.
///
/// Every method is invoked by all processes in the same order; implementations
/// may block until all ranks arrive.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process, in `0..world_size`.
    fn rank(&self) -> usize;

    /// Number of cooperating processes.
    fn world_size(&self) -> usize;

    /// Block until every process reaches this call.
    fn barrier(&self) -> TrainerResult<()>;

    /// Element-wise sum of `values` across all processes, written back
    /// in place on every rank.
    fn all_reduce_sum(&self, values: &mut [f64]) -> TrainerResult<()>;

    /// Concatenate `tensor` from every rank along dimension 0, in ascending
    /// rank order. Every rank receives the same result.
    fn all_gather(&self, tensor: &Tensor) -> TrainerResult<Tensor>;
}

/// Trivial group for single-process runs. Every collective is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> TrainerResult<()> {
        Ok(())
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> TrainerResult<()> {
        Ok(())
    }

    fn all_gather(&self, tensor: &Tensor) -> TrainerResult<Tensor> {
        Ok(tensor.clone())
    }
}

/// Closure over a communication backend.
type BarrierFn = Box<dyn Fn() -> TrainerResult<()> + Send + Sync>;
type ReduceFn = Box<dyn Fn(&mut [f64]) -> TrainerResult<()> + Send + Sync>;
type GatherFn = Box<dyn Fn(&Tensor) -> TrainerResult<Tensor> + Send + Sync>;

/// [`ProcessGroup`] backed by injected callbacks.
///
/// Lets the embedding application bring its own collectives while the engine
/// stays backend-agnostic. Also convenient in tests, where the callbacks can
/// play the part of the other ranks.
pub struct CallbackGroup {
    rank: usize,
    world_size: usize,
    barrier: BarrierFn,
    reduce: ReduceFn,
    gather: GatherFn,
}

impl CallbackGroup {
    /// Build a group from backend callbacks.
    pub fn new(
        rank: usize,
        world_size: usize,
        barrier: BarrierFn,
        reduce: ReduceFn,
        gather: GatherFn,
    ) -> Self {
        Self {
            rank,
            world_size,
            barrier,
            reduce,
            gather,
        }
    }
}

impl std::fmt::Debug for CallbackGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

impl ProcessGroup for CallbackGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> TrainerResult<()> {
        (self.barrier)()
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> TrainerResult<()> {
        (self.reduce)(values)
    }

    fn all_gather(&self, tensor: &Tensor) -> TrainerResult<Tensor> {
        (self.gather)(tensor)
    }
}
