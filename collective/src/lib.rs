mod error;
mod local;

pub use error::{CollectiveErr, Result};
pub use local::LocalGroup;

/// A synchronous sum-combine over a fixed worker group.
///
/// Contract:
/// - `all_reduce_sum` blocks until every worker in the group has contributed
///   and delivers the identical sum to every caller.
/// - Every worker must issue its collective calls in the same order; a
///   detectable failure must surface as `Err`, never as a silent hang.
/// - The handle is the single source of worker identity: exactly one
///   participant reports rank 0, and every participant reports the same
///   `world_size` for the lifetime of the group.
pub trait Collective {
    /// This worker's position within the group.
    fn rank(&self) -> usize;

    /// The fixed number of workers in the group.
    fn world_size(&self) -> usize;

    /// Whether this worker is the group leader (rank 0).
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Element-wise sums `buf` with every other worker's contribution,
    /// leaving the combined result in `buf` on every worker.
    ///
    /// # Arguments
    /// * `buf` - This worker's contribution, overwritten with the group sum.
    ///
    /// # Returns
    /// `Ok(())` once every worker holds the identical sum.
    ///
    /// # Errors
    /// Returns `CollectiveErr` on any detectable group failure. The contents
    /// of `buf` are unspecified afterwards and must not be used.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()>;
}
