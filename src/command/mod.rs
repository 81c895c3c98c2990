pub mod build;
pub mod dockerfile;
pub mod entry;
pub mod env;
pub mod exec_probe;
pub mod plan;
pub mod probe;
pub mod run;
