pub mod plan;
pub mod run;
