pub mod core;
pub mod eligibility;
pub mod enrollments;
pub mod grades;
pub mod grading_config;
pub mod periods;
pub mod supplementary;
pub mod trimesters;
