pub mod config;
pub mod types;

pub use config::{
    ConfigError, FiltersConfig, GsastConfig, Provider, ScannerName, Target,
};
pub use types::{
    rule_key, split_rule_key, Job, JobStatus, ProjectResults, RepositoryDescriptor, RuleFile,
    ScanId, ScanRecord, ScanStatus, ScannerId,
};
