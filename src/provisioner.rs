//! 设备准备模块
//!
//! Gets a target from "nothing" to "firmware flashed and reset": build (or
//! accept a pre-built) image, write it to the board, reset. Boot completion is
//! not observed here; the shell session waits for the prompt.
//!
//! Building and flashing are delegated to [`ImageBuilder`] and [`Flasher`] so
//! the retry policy can be exercised without hardware. The stock
//! implementations run the commands configured for the target.

use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

use crate::config::target_config::TargetConfig;
use crate::utils::{self, expand_placeholders, tail_lines};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Failed(String),
}

/// Build output for one target. Consumed by [`Provisioner::flash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub target: String,
    pub status: BuildStatus,
    pub path: Option<PathBuf>,
}

impl Image {
    pub fn is_built(&self) -> bool {
        self.status == BuildStatus::Success
    }
}

/// Produces the flashable payload for a target.
#[cfg_attr(test, mockall::automock)]
pub trait ImageBuilder: Send + Sync {
    fn build(&self, target: &TargetConfig) -> Result<PathBuf>;
}

#[derive(Debug, Error)]
pub enum FlashError {
    /// Worth another attempt (busy programmer, flaky USB, ...)
    #[error("{0}")]
    Transient(String),
    #[error("device not present: {0}")]
    DeviceNotPresent(String),
    #[error("flash configuration error: {0}")]
    Config(String),
}

/// Writes images to boards and resets them.
#[cfg_attr(test, mockall::automock)]
pub trait Flasher: Send + Sync {
    fn flash(&self, target: &TargetConfig, image: &Path) -> Result<(), FlashError>;
    fn reset(&self, target: &TargetConfig) -> Result<(), FlashError>;
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("build failed for {target}: {reason}")]
    Build { target: String, reason: String },
    #[error("flashing {target} failed after {attempts} attempt(s): {source}")]
    Flash {
        target: String,
        attempts: u32,
        #[source]
        source: FlashError,
    },
}

pub struct Provisioner {
    builder: Arc<dyn ImageBuilder>,
    flasher: Arc<dyn Flasher>,
    build_images: bool,
    skip_flash: bool,
}

impl Provisioner {
    pub fn new(builder: Arc<dyn ImageBuilder>, flasher: Arc<dyn Flasher>) -> Self {
        Self {
            builder,
            flasher,
            build_images: false,
            skip_flash: false,
        }
    }

    /// Run the configured build commands instead of using pre-built images.
    pub fn with_build(mut self, build_images: bool) -> Self {
        self.build_images = build_images;
        self
    }

    /// Skip flashing for every target (`--no-flash`).
    pub fn with_skip_flash(mut self, skip_flash: bool) -> Self {
        self.skip_flash = skip_flash;
        self
    }

    pub fn skips_flash(&self, target: &TargetConfig) -> bool {
        self.skip_flash || target.skip_flash
    }

    /// Builds the image for `target`, or locates the pre-built one.
    ///
    /// Never fails outright: the outcome is carried in [`Image::status`].
    pub fn build(&self, target: &TargetConfig) -> Image {
        let failed = |reason: String| {
            error!("[{}] {reason}", target.name);
            Image {
                target: target.name.clone(),
                status: BuildStatus::Failed(reason),
                path: None,
            }
        };

        if self.build_images && target.build.command.is_some() {
            info!("[{}] Building image", target.name);
            return match self.builder.build(target) {
                Ok(path) => {
                    info!("[{}] Image ready: {}", target.name, path.display());
                    Image {
                        target: target.name.clone(),
                        status: BuildStatus::Success,
                        path: Some(path),
                    }
                }
                Err(e) => failed(format!("{e:#}")),
            };
        }

        let path = target.build.image_path();
        if self.skips_flash(target) {
            debug!("[{}] Not flashing, image is not required", target.name);
            return Image {
                target: target.name.clone(),
                status: BuildStatus::Success,
                path,
            };
        }
        match path {
            Some(path) if path.exists() => {
                debug!("[{}] Using pre-built image {}", target.name, path.display());
                Image {
                    target: target.name.clone(),
                    status: BuildStatus::Success,
                    path: Some(path),
                }
            }
            Some(path) => failed(format!("pre-built image {} does not exist", path.display())),
            None => failed("no image configured and building is disabled".to_string()),
        }
    }

    /// Flashes `image` and resets the board.
    ///
    /// Transient failures are retried with the target's backoff; a missing
    /// device or bad configuration fails immediately.
    pub fn flash(&self, target: &TargetConfig, image: Image) -> Result<(), ProvisionError> {
        if let BuildStatus::Failed(reason) = image.status {
            return Err(ProvisionError::Build {
                target: target.name.clone(),
                reason,
            });
        }
        if self.skips_flash(target) {
            info!("[{}] Skipping flash", target.name);
            return Ok(());
        }
        let path = image.path.ok_or_else(|| ProvisionError::Build {
            target: target.name.clone(),
            reason: "image has no path".to_string(),
        })?;

        let attempts = target.retry.flash_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(
                "[{}] Flashing {} (attempt {attempt}/{attempts})",
                target.name,
                path.display()
            );
            let outcome = self
                .flasher
                .flash(target, &path)
                .and_then(|()| self.flasher.reset(target));
            match outcome {
                Ok(()) => {
                    info!("[{}] Flashed and reset", target.name);
                    return Ok(());
                }
                Err(FlashError::Transient(reason)) if attempt < attempts => {
                    warn!(
                        "[{}] Flash attempt {attempt} failed: {reason}; retrying in {:?}",
                        target.name, target.retry.flash_backoff
                    );
                    thread::sleep(target.retry.flash_backoff);
                }
                Err(source) => {
                    error!("[{}] Flashing failed: {source}", target.name);
                    return Err(ProvisionError::Flash {
                        target: target.name.clone(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}

/// Runs `build.command` from the target configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandImageBuilder;

impl ImageBuilder for CommandImageBuilder {
    fn build(&self, target: &TargetConfig) -> Result<PathBuf> {
        let Some(template) = &target.build.command else {
            bail!("no build command configured");
        };
        let command = expand_placeholders(template, &[("target", target.name.as_str())]);
        let output = utils::run_shell(&command, target.build.workdir.as_deref(), target.build.timeout)
            .with_context(|| format!("build command for {}", target.name))?;
        if !output.success() {
            bail!(
                "`{command}` exited with {:?}:\n{}",
                output.exit_code,
                tail_lines(&output.combined(), 20)
            );
        }
        let path = target
            .build
            .image_path()
            .context("build succeeded but no `image` path is configured")?;
        if !path.exists() {
            bail!("build succeeded but {} was not produced", path.display());
        }
        Ok(path)
    }
}

/// Runs the target's flash and reset commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandFlasher;

impl CommandFlasher {
    fn run(&self, target: &TargetConfig, template: &str, image: Option<&Path>) -> Result<(), FlashError> {
        let image = image.map(|p| p.display().to_string()).unwrap_or_default();
        let command = expand_placeholders(
            template,
            &[
                ("image", image.as_str()),
                ("port", target.port()),
                ("target", target.name.as_str()),
            ],
        );
        let output = utils::run_shell(&command, target.build.workdir.as_deref(), target.flash.timeout)
            .map_err(|e| FlashError::Transient(format!("{e:#}")))?;
        if output.success() {
            return Ok(());
        }

        let combined = output.combined();
        if let Some(pattern) = &target.flash.absent_pattern {
            let absent = Regex::new(pattern)
                .map_err(|e| FlashError::Config(format!("invalid absent_pattern: {e}")))?;
            if absent.is_match(&combined) {
                return Err(FlashError::DeviceNotPresent(tail_lines(&combined, 5)));
            }
        }
        Err(FlashError::Transient(format!(
            "`{command}` exited with {:?}: {}",
            output.exit_code,
            tail_lines(&combined, 5)
        )))
    }
}

impl Flasher for CommandFlasher {
    fn flash(&self, target: &TargetConfig, image: &Path) -> Result<(), FlashError> {
        match &target.flash.command {
            Some(template) => self.run(target, template, Some(image)),
            None => Err(FlashError::Config(format!(
                "target {} has no flash command",
                target.name
            ))),
        }
    }

    fn reset(&self, target: &TargetConfig) -> Result<(), FlashError> {
        match &target.flash.reset_command {
            Some(template) => self.run(target, template, None),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;
    use std::time::Duration;

    fn target() -> TargetConfig {
        let mut target = TargetConfig::new("armv7a9-zynq7000-zedboard", "/dev/ttyUSB0");
        target.build.command = Some("make".to_string());
        target.build.image = Some(PathBuf::from("/tmp/phoenix.disk"));
        target.retry.flash_backoff = Duration::from_millis(1);
        target
    }

    fn built(target: &TargetConfig) -> Image {
        Image {
            target: target.name.clone(),
            status: BuildStatus::Success,
            path: Some(PathBuf::from("/tmp/phoenix.disk")),
        }
    }

    fn provisioner(builder: MockImageBuilder, flasher: MockFlasher) -> Provisioner {
        Provisioner::new(Arc::new(builder), Arc::new(flasher))
    }

    #[test_log::test]
    fn build_uses_builder_when_requested() {
        let mut builder = MockImageBuilder::new();
        builder
            .expect_build()
            .times(1)
            .returning(|_| Ok(PathBuf::from("/out/phoenix.disk")));
        let p = provisioner(builder, MockFlasher::new()).with_build(true);
        let image = p.build(&target());
        assert!(image.is_built());
        assert_eq!(image.path, Some(PathBuf::from("/out/phoenix.disk")));
    }

    #[test_log::test]
    fn build_failure_is_carried_in_image() {
        let mut builder = MockImageBuilder::new();
        builder
            .expect_build()
            .returning(|_| Err(anyhow::anyhow!("make: *** [all] Error 2")));
        let p = provisioner(builder, MockFlasher::new()).with_build(true);
        let t = target();
        let image = p.build(&t);
        assert!(matches!(image.status, BuildStatus::Failed(ref r) if r.contains("Error 2")));
        assert!(matches!(p.flash(&t, image), Err(ProvisionError::Build { .. })));
    }

    #[test]
    fn missing_prebuilt_image_fails_build() {
        let mut builder = MockImageBuilder::new();
        builder.expect_build().never();
        let p = provisioner(builder, MockFlasher::new());
        let mut t = target();
        t.build.image = Some(PathBuf::from("/definitely/not/here.disk"));
        assert!(!p.build(&t).is_built());
    }

    #[test]
    fn prebuilt_image_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("phoenix.disk");
        std::fs::write(&image, b"img").unwrap();
        let p = provisioner(MockImageBuilder::new(), MockFlasher::new());
        let mut t = target();
        t.build.image = Some(image.clone());
        assert_eq!(p.build(&t).path, Some(image));
    }

    #[test_log::test]
    fn transient_flash_errors_are_retried() {
        let mut flasher = MockFlasher::new();
        let mut seq = Sequence::new();
        flasher
            .expect_flash()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(FlashError::Transient("busy".into())));
        flasher
            .expect_flash()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        flasher.expect_reset().times(1).returning(|_| Ok(()));
        let p = provisioner(MockImageBuilder::new(), flasher);
        let t = target();
        p.flash(&t, built(&t)).unwrap();
    }

    #[test_log::test]
    fn flash_gives_up_after_configured_attempts() {
        let mut flasher = MockFlasher::new();
        flasher
            .expect_flash()
            .times(3)
            .returning(|_, _| Err(FlashError::Transient("busy".into())));
        flasher.expect_reset().never();
        let p = provisioner(MockImageBuilder::new(), flasher);
        let t = target();
        let err = p.flash(&t, built(&t)).unwrap_err();
        assert!(matches!(err, ProvisionError::Flash { attempts: 3, .. }));
    }

    #[test_log::test]
    fn missing_device_is_not_retried() {
        let mut flasher = MockFlasher::new();
        flasher
            .expect_flash()
            .times(1)
            .returning(|_, _| Err(FlashError::DeviceNotPresent("no device found".into())));
        let p = provisioner(MockImageBuilder::new(), flasher);
        let t = target();
        let err = p.flash(&t, built(&t)).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Flash {
                attempts: 1,
                source: FlashError::DeviceNotPresent(_),
                ..
            }
        ));
    }

    #[test]
    fn skip_flash_is_a_no_op() {
        let mut flasher = MockFlasher::new();
        flasher.expect_flash().never();
        flasher.expect_reset().never();
        let p = provisioner(MockImageBuilder::new(), flasher).with_skip_flash(true);
        let mut t = target();
        t.build.image = None;
        let image = p.build(&t);
        assert!(image.is_built());
        p.flash(&t, image).unwrap();
    }

    #[test]
    fn command_flasher_detects_absent_device() {
        let mut t = target();
        t.flash.command = Some("echo 'error: no device found on {port}' >&2; exit 1".to_string());
        t.flash.absent_pattern = Some("no device found".to_string());
        let err = CommandFlasher.flash(&t, Path::new("/tmp/x")).unwrap_err();
        assert!(matches!(err, FlashError::DeviceNotPresent(ref out) if out.contains("/dev/ttyUSB0")));

        t.flash.command = Some("exit 1".to_string());
        assert!(matches!(
            CommandFlasher.flash(&t, Path::new("/tmp/x")),
            Err(FlashError::Transient(_))
        ));
    }

    #[test]
    fn command_flasher_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("flash.log");
        let mut t = target();
        t.flash.command = Some(format!("echo {{target}} {{image}} > {}", log.display()));
        CommandFlasher.flash(&t, Path::new("/img/phoenix.disk")).unwrap();
        let written = std::fs::read_to_string(&log).unwrap();
        assert_eq!(written.trim(), "armv7a9-zynq7000-zedboard /img/phoenix.disk");
    }

    #[test]
    fn command_builder_requires_produced_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = target();
        t.build.workdir = Some(dir.path().to_path_buf());
        t.build.image = Some(PathBuf::from("out.disk"));
        t.build.command = Some("true".to_string());
        assert!(CommandImageBuilder.build(&t).is_err());

        t.build.command = Some("touch out.disk".to_string());
        assert_eq!(CommandImageBuilder.build(&t).unwrap(), dir.path().join("out.disk"));
    }
}
