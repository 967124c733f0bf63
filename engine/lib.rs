#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod attribution;
pub mod batch;
pub mod config;
pub mod explain;
pub mod impute;
pub mod inference;
pub mod model;
pub mod normalize;
pub mod predictor;
pub mod report;
pub mod schema;
pub mod test_fixtures;
pub mod types;
