use std::process::{Command, Stdio};

use log::debug;

use crate::error::SampleError;

/// Prefix that command-line backends put in front of the program they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Privilege {
    #[default]
    User,
    Sudo,
}

/// Runs `program args...` and returns its stdout.
///
/// A missing program, a refused execution or a non-zero exit status make the source unavailable.
pub(crate) fn run_command(program: &str, args: &[String], privilege: Privilege) -> Result<String, SampleError> {
    let source_name = format!("`{program}`");
    let mut cmd = match privilege {
        Privilege::User => Command::new(program),
        Privilege::Sudo => {
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", program]);
            cmd
        }
    };
    cmd.args(args).env("LC_ALL", "C").stdin(Stdio::null());
    debug!("running {cmd:?}");

    let output = cmd.output().map_err(|e| SampleError::unavailable(&source_name, e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SampleError::unavailable(
            &source_name,
            format!("{} ({})", output.status, stderr.trim_end()),
        ));
    }
    String::from_utf8(output.stdout).map_err(|e| SampleError::parse(source_name, e.to_string()))
}
