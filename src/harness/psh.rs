//! psh shell checks.

use crate::harness::{Dut, Harness, HarnessResult};

/// `/etc/shells` as shipped in the root filesystem, raw console line endings.
pub const SHELLS_PATTERN: &str = r"# /etc/shells: valid login shells(\r+)\n/bin/sh(\r+)\n";

/// Concatenates `/etc/shells` with the psh `cat` command.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatShells;

impl Harness for CatShells {
    fn run(&self, dut: &mut Dut<'_>) -> HarnessResult {
        dut.init()?;
        dut.assert_cmd(
            "cat etc/shells",
            SHELLS_PATTERN,
            Some("The /etc/shells/ file content is invalid"),
            true,
        )
    }
}
