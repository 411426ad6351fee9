pub mod run;
pub mod tables;
pub mod version;
