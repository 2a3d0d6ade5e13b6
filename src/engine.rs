// Values, units, and the compiled-expression seams of the evaluation engine.
pub mod callable;
pub mod convert;
pub mod distribution;
pub mod scope;
pub mod units;
pub mod value;
