pub mod analytics;
pub mod backup;
pub mod core;
pub mod grading;
pub mod marks;
pub mod reports;
pub mod setup;
pub mod students;
pub mod subjects;
