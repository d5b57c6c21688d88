pub mod analysis;
pub mod pipeline;
pub mod report;
pub mod staging;
pub mod storage;
pub mod tools;
pub mod workspace;
