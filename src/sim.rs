// The simulation stepper and the two-view shadowing scope it evaluates under.
pub mod shadow;
pub mod stepper;

use serde::{Deserialize, Serialize};

use crate::{impl_add_primitive, impl_from_primitive};

/// Zero-based timestep counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct StepCount(pub u64);
impl_from_primitive!(StepCount, u64);
impl_add_primitive!(StepCount, u64);

/// Replicate identifier flowed through outputs and the wire protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Replicate(pub u32);
impl_from_primitive!(Replicate, u32);
