//! Spawning and reaping CGI children

use std::ffi::OsString;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

/// A freshly spawned child with the parent's ends of its three pipes
#[derive(Debug)]
pub struct Spawned {
    pub child: Child,
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd
}

/// Runs `argv[0]` with `argv[1..]` in an environment holding only `env`.
///
/// The child's stdio are pipes; every other descriptor of ours is
/// close-on-exec and so never reaches it. The pipe ends handed back are
/// still blocking.
pub fn spawn_subprocess<'a, I>(argv: &[OsString], env: I, cwd: Option<&Path>)
                               -> io::Result<Spawned>
    where I: IntoIterator<Item = (&'a String, &'a String)>
{
    let (program, args) = argv.split_first().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "empty argv")
    })?;

    let mut command = Command::new(program);
    command.args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn()?;

    let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
    match pipes {
        (Some(stdin), Some(stdout), Some(stderr)) => Ok(Spawned {
            child,
            stdin: stdin.into(),
            stdout: stdout.into(),
            stderr: stderr.into()
        }),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            Err(io::Error::new(io::ErrorKind::Other, "child is missing a stdio pipe"))
        }
    }
}

/// A running CGI child and what we know about how it ended
#[derive(Debug)]
pub struct CgiProcess {
    child: Option<Child>,
    pid: u32,
    exit: Option<ExitStatus>
}

impl CgiProcess {
    pub fn new(child: Child) -> CgiProcess {
        CgiProcess { pid: child.id(), child: Some(child), exit: None }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Checks, without blocking, whether the child has exited
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!("CGI process {} exited: {}", self.pid, status);
                        self.exit = Some(status);
                    },
                    Ok(None) => (),
                    Err(e) => warn!("waitpid on CGI process {} failed: {}", self.pid, e)
                }
            }
        }
        self.exit
    }

    /// `true` once the child is known to have exited nonzero or by signal
    pub fn failed(&self) -> bool {
        self.exit.map_or(false, |status| !status.success())
    }

    /// Sends `SIGKILL` unless the child is already known to be gone
    pub fn kill(&mut self) {
        if self.poll_exit().is_some() {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            match child.kill() {
                Ok(()) => info!("Sent SIGKILL to CGI process {}", self.pid),
                Err(e) => warn!("Could not kill CGI process {}: {}", self.pid, e)
            }
        }
        self.poll_exit();
    }

    /// Kills the child if needed and hands it over to `reaper` unless it
    /// has already been waited for
    pub fn retire(mut self, reaper: &mut Reaper) {
        self.kill();
        if self.exit.is_none() {
            if let Some(child) = self.child.take() {
                reaper.adopt(child);
            }
        }
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if self.exit.is_none() {
                let _ = child.kill();
                let _ = child.try_wait();
            }
        }
    }
}

/// Children that were killed but not yet waited for
#[derive(Debug, Default)]
pub struct Reaper {
    children: Vec<Child>
}

impl Reaper {
    pub fn new() -> Reaper {
        Reaper { children: Vec::new() }
    }

    pub fn adopt(&mut self, child: Child) {
        debug!("Reaper adopted CGI process {}", child.id());
        self.children.push(child);
    }

    /// Waits, without blocking, for every adopted child that has exited
    pub fn reap(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Reaped CGI process {}: {}", child.id(), status);
                false
            },
            Ok(None) => true,
            Err(e) => {
                warn!("waitpid on CGI process {} failed: {}", child.id(), e);
                false
            }
        });
    }

    /// Children still waiting to be reaped
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::BTreeMap;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::{Duration, Instant};

    fn argv(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn environment_is_exactly_what_we_pass() {
        let mut env = BTreeMap::new();
        env.insert(String::from("ONLY_THIS"), String::from("yes"));

        let spawned = spawn_subprocess(&argv(&["/usr/bin/env"]), &env, None).unwrap();
        let Spawned { mut child, stdin, stdout, .. } = spawned;
        drop(stdin);

        let mut output = String::new();
        File::from(stdout).read_to_string(&mut output).unwrap();
        child.wait().unwrap();

        assert_eq!(output, "ONLY_THIS=yes\n");
    }

    #[test]
    fn pipes_carry_stdin_to_stdout() {
        let env: BTreeMap<String, String> = BTreeMap::new();
        let spawned = spawn_subprocess(&argv(&["/bin/cat"]), &env, None).unwrap();
        let Spawned { mut child, stdin, stdout, .. } = spawned;

        let mut stdin = File::from(stdin);
        stdin.write_all(b"round trip").unwrap();
        drop(stdin);

        let mut output = Vec::new();
        File::from(stdout).read_to_end(&mut output).unwrap();
        child.wait().unwrap();
        assert_eq!(output, b"round trip");
    }

    #[test]
    fn missing_programs_fail_to_spawn() {
        let env: BTreeMap<String, String> = BTreeMap::new();
        assert!(spawn_subprocess(&argv(&["/nonexistent/program"]), &env, None).is_err());
        assert!(spawn_subprocess(&[], &env, None).is_err());
    }

    #[test]
    fn killed_children_are_reaped_later() {
        let env: BTreeMap<String, String> = BTreeMap::new();
        let spawned = spawn_subprocess(&argv(&["/bin/sleep", "30"]), &env, None).unwrap();
        let mut process = CgiProcess::new(spawned.child);
        assert!(process.poll_exit().is_none());

        let mut reaper = Reaper::new();
        process.retire(&mut reaper);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !reaper.is_empty() {
            assert!(Instant::now() < deadline, "child never reaped");
            thread::sleep(Duration::from_millis(10));
            reaper.reap();
        }
    }

    #[test]
    fn nonzero_exits_count_as_failures() {
        let env: BTreeMap<String, String> = BTreeMap::new();
        let spawned = spawn_subprocess(&argv(&["/bin/sh", "-c", "exit 3"]), &env, None).unwrap();
        let mut process = CgiProcess::new(spawned.child);

        let deadline = Instant::now() + Duration::from_secs(5);
        while process.poll_exit().is_none() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(10));
        }
        assert!(process.failed());
    }
}
