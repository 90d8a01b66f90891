use std::path::Path;

use anyhow::Result;

use crate::clients::process::Invocation;
use crate::clients::process::ProcessOutput;
use crate::clients::process::ProcessRunner;
use crate::git::auth::GitEnv;
use crate::git::error::GitError;
use crate::git::exit;
use crate::git::exit::Probe;

/// Run git in `dir` and return its stdout, failing on any nonzero exit.
pub(crate) async fn git<R, I, S>(runner: &R, dir: &Path, env: &GitEnv, args: I) -> Result<String>
where
    R: ProcessRunner,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let (invocation, output) = run(runner, dir, env, args).await?;
    if !output.success() {
        return Err(GitError::from_output(invocation.to_string(), &output).into());
    }
    Ok(output.stdout)
}

/// Run a git probe in `dir` and return its boolean answer.
pub(crate) async fn probe<R, I, S>(
    runner: &R,
    dir: &Path,
    env: &GitEnv,
    probe: Probe,
    args: I,
) -> Result<bool>
where
    R: ProcessRunner,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let (invocation, output) = run(runner, dir, env, args).await?;
    Ok(exit::interpret(probe, invocation.to_string(), &output)?)
}

async fn run<R, I, S>(
    runner: &R,
    dir: &Path,
    env: &GitEnv,
    args: I,
) -> Result<(Invocation, ProcessOutput)>
where
    R: ProcessRunner,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let invocation = Invocation::new("git", dir).args(args).envs(&env.vars);
    let output = runner.run(&invocation).await?;
    Ok((invocation, output))
}
