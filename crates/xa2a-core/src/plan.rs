//! Plan construction
//!
//! Shape-dependent checks happen once, here, so that executing (and
//! replaying a captured) call never re-runs them.

use crate::eligibility::block_count;
use crate::error::ShapeError;
use crate::kernel::PlanArtifact;
use crate::tensor::TensorView;

/// Split counts normalised to the kernel's 64-bit layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSplits {
    pub output_sizes: Vec<i64>,
    pub input_sizes: Vec<i64>,
    pub output_offsets: Option<Vec<i64>>,
    pub input_offsets: Option<Vec<i64>>,
}

/// Widen any integer split list to `i64`.
pub fn normalize<S: Copy + Into<i64>>(splits: &[S]) -> Vec<i64> {
    splits.iter().map(|&s| s.into()).collect()
}

fn check_splits(which: &'static str, splits: &[i64], world_size: usize) -> Result<(), ShapeError> {
    if splits.len() != world_size {
        return Err(ShapeError::SplitLength {
            which,
            world_size,
            actual: splits.len(),
        });
    }
    if let Some((index, &value)) = splits.iter().enumerate().find(|(_, &v)| v < 0) {
        return Err(ShapeError::NegativeSplit { which, index, value });
    }
    Ok(())
}

fn check_rank2(which: &'static str, t: &TensorView) -> Result<(), ShapeError> {
    if t.ndim() != 2 {
        return Err(ShapeError::TensorRank {
            which,
            shape: t.shape.clone(),
        });
    }
    Ok(())
}

/// Validate one call's arguments against the group.
///
/// Split and offset lists must carry one entry per rank; both tensors must
/// be `[rows, row_width]` with the same `row_width`.
pub fn validate_plan_inputs(
    output: &TensorView,
    input: &TensorView,
    splits: &NormalizedSplits,
    world_size: usize,
) -> Result<usize, ShapeError> {
    check_splits("output_split_sizes", &splits.output_sizes, world_size)?;
    check_splits("input_split_sizes", &splits.input_sizes, world_size)?;
    if let Some(offsets) = &splits.output_offsets {
        check_splits("output_split_offsets", offsets, world_size)?;
    }
    if let Some(offsets) = &splits.input_offsets {
        check_splits("input_split_offsets", offsets, world_size)?;
    }
    check_rank2("output", output)?;
    check_rank2("input", input)?;
    if output.row_width() != input.row_width() {
        return Err(ShapeError::RowWidthMismatch {
            output: output.row_width(),
            input: input.row_width(),
        });
    }
    Ok(input.row_width())
}

/// A validated, kernel-ready all-to-all call.
///
/// Tied to the shapes it was built from; build a new plan when they change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    artifact: PlanArtifact,
    row_width: usize,
    splits: NormalizedSplits,
}

impl Plan {
    pub(crate) fn new(artifact: PlanArtifact, row_width: usize, splits: NormalizedSplits) -> Self {
        Self {
            artifact,
            row_width,
            splits,
        }
    }

    pub fn artifact(&self) -> &PlanArtifact {
        &self.artifact
    }

    /// Elements per row moved by the kernel
    pub fn row_width(&self) -> usize {
        self.row_width
    }

    pub fn splits(&self) -> &NormalizedSplits {
        &self.splits
    }

    /// Input rows this plan sends, `None` if the count overflows
    pub fn input_block_count(&self) -> Option<i64> {
        block_count(&self.splits.input_sizes, self.splits.input_offsets.as_deref())
    }

    /// Output rows this plan receives, `None` if the count overflows
    pub fn output_block_count(&self) -> Option<i64> {
        block_count(&self.splits.output_sizes, self.splits.output_offsets.as_deref())
    }
}
