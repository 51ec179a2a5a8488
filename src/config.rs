//! Run configuration.
//!
//! Everything the scheduler needs is loaded from a single TOML file into a
//! [`RunConfig`](root_config::RunConfig) and then narrowed by command line flags.

pub mod cli_args;
pub mod executor_config;
pub mod root_config;
pub mod serial_config;
pub mod target_config;
pub mod test_config;

pub use executor_config::ExecutorConfig;
pub use root_config::RunConfig;
pub use serial_config::SerialConfig;
pub use target_config::{BuildConfig, FlashConfig, RetryConfig, TargetConfig};
pub use test_config::{StepConfig, TestConfig};
