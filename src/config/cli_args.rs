use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Log verbosity accepted by `--log-level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Filter string understood by `env_logger`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

// Boardtestor - build, flash and test boards over their serial shell
#[derive(Parser, Debug)]
#[clap(
    name = "boardtestor",
    version,
    about = "Build, flash and run shell tests on embedded targets over serial",
    after_help = "EXAMPLES:\n  boardtestor -c runner.toml\n  boardtestor -c runner.toml -T armv7a9-zynq7000-qemu --build\n  boardtestor -c runner.toml --no-flash -s /dev/ttyACM0 -b 460800 -t psh/cat-shells"
)]
pub struct CliArgs {
    // Run configuration file
    // 运行配置文件
    #[clap(short = 'c', long = "config", default_value = "runner.toml", help = "Run configuration file")]
    pub config: PathBuf,

    // Filter targets; may be repeated. All configured targets run by default
    // 筛选目标，可多次使用
    #[clap(short = 'T', long = "target", help = "Only run on this target (repeatable)")]
    pub target: Vec<String>,

    // Filter tests by name; may be repeated
    // 按名称筛选测试，可多次使用
    #[clap(short = 't', long = "test", help = "Only run this test (repeatable)")]
    pub test: Vec<String>,

    #[clap(long = "build", help = "Build firmware images before flashing")]
    pub build: bool,

    #[clap(short = 'l', long = "log-level", value_enum, default_value = "info", help = "Log verbosity")]
    pub log_level: LogLevel,

    // Serial port override for every selected target
    // 串口覆盖
    #[clap(short = 's', long = "serial", help = "Serial port used to talk to the board")]
    pub serial: Option<String>,

    #[clap(short = 'b', long = "baudrate", help = "Serial line speed")]
    pub baudrate: Option<u32>,

    #[clap(long = "no-flash", help = "Assume boards are already flashed and running")]
    pub no_flash: bool,

    #[clap(short = 'j', long = "jobs", help = "Number of targets tested concurrently")]
    pub jobs: Option<usize>,

    #[clap(short = 'o', long = "output", help = "Write a JSON run report to this file")]
    pub output: Option<PathBuf>,

    #[clap(long = "markdown", help = "Write a markdown run summary to this file")]
    pub markdown: Option<PathBuf>,
}

impl CliArgs {
    /// Parse command line arguments
    /// 解析命令行参数
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get log level filter
    /// 获取日志级别
    pub fn get_log_level(&self) -> &str {
        self.log_level.as_filter()
    }
}
