pub mod parameters;

pub use parameters::{standard_catalog, Parameter, ParameterCategory};
