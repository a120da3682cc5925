//! An external simulator run as a child process.
//!
//! Commands go to the child's stdin.  Its stdout and stderr are drained by two threads into one
//! shared buffer, so the child never blocks on a full pipe while the caller is busy writing.
//! Text is dropped from the buffer once [`ExecProcess::wait_for`] has returned it.
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::string::String;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::vec::Vec;

use alloc::format;

use crate::error::{Error, Result};

/// How often [`ExecProcess::wait_for`] looks at the output.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn io_error(what: &str, e: std::io::Error) -> Error {
    Error::Transport(format!("{}: {}", what, e))
}

pub struct ExecProcess {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    output: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

/// Decode the complete characters at the front of `pending`, leaving a trailing partial UTF-8
/// sequence for the next read.  Bytes that can never be valid become U+FFFD.
fn decode_complete(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(s) => {
                text.push_str(s);
                pending.clear();
                return text;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return text;
                    }
                }
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R, output: Arc<Mutex<String>>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 1024];
        let mut pending = Vec::new();
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let text = decode_complete(&mut pending);
                    output
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_str(&text);
                }
            }
        }
        if !pending.is_empty() {
            output
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_str(&String::from_utf8_lossy(&pending));
        }
    })
}

impl ExecProcess {
    /// Start `program` with `args`, optionally in `dir` and with extra environment variables.
    pub fn spawn(
        program: &str,
        args: &[&str],
        dir: Option<&Path>,
        env: &[(&str, &str)],
    ) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env.iter().copied())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| io_error(&format!("can't start {}", program), e))?;
        log::debug!("started {} (pid {})", program, child.id());

        let output = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(drain(out, output.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(drain(err, output.clone()));
        }
        Ok(Self {
            program: String::from(program),
            stdin: child.stdin.take(),
            child,
            output,
            readers,
        })
    }

    /// Send one line to the child's stdin.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            Error::Transport(format!("stdin of {} is already closed", self.program))
        })?;
        log::trace!("{} <- {}", self.program, line);
        writeln!(stdin, "{}", line)
            .and_then(|_| stdin.flush())
            .map_err(|e| io_error(&format!("write to {}", self.program), e))
    }

    /// What the child has printed that no `wait_for` has returned yet.
    pub fn output(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&mut self) -> Result<bool> {
        self.child
            .try_wait()
            .map(|status| status.is_none())
            .map_err(|e| io_error(&format!("status of {}", self.program), e))
    }

    /// Remove and return the output up to and including `prompt`, if it has arrived.
    fn take_through(&self, prompt: &str) -> Option<String> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        let end = output.find(prompt)? + prompt.len();
        Some(output.drain(..end).collect())
    }

    /// Wait until `prompt` appears in output not yet returned, and return that output up to
    /// and including the prompt.  Fails after `timeout`, or once the child has exited without
    /// printing it.
    pub fn wait_for(&mut self, prompt: &str, timeout: Duration) -> Result<String> {
        let start = Instant::now();
        loop {
            let exited = !self.is_running()?;
            if let Some(text) = self.take_through(prompt) {
                return Ok(text);
            }
            if exited {
                // the readers may still hold the last of the output
                self.join_readers();
                if let Some(text) = self.take_through(prompt) {
                    return Ok(text);
                }
                return Err(Error::Transport(format!(
                    "{} exited before printing '{}'",
                    self.program, prompt
                )));
            }
            if start.elapsed() >= timeout {
                return Err(Error::Transport(format!(
                    "timed out after {:?} waiting for '{}' from {}",
                    timeout, prompt, self.program
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn join_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }

    /// Close stdin and wait for the child to exit.  Returns its exit code, if it had one.
    pub fn finish(mut self) -> Result<Option<i32>> {
        drop(self.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|e| io_error(&format!("wait for {}", self.program), e))?;
        self.join_readers();
        log::debug!("{} finished: {}", self.program, status);
        Ok(status.code())
    }
}

impl Drop for ExecProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn partial_characters_wait_for_the_next_read() {
        let bytes = "ready é\n".as_bytes();
        let split = bytes.len() - 2;
        let mut pending = Vec::from(&bytes[..split]);
        assert_eq!(decode_complete(&mut pending), "ready ");
        assert_eq!(pending, [0xc3]);
        pending.extend_from_slice(&bytes[split..]);
        assert_eq!(decode_complete(&mut pending), "é\n");
        assert!(pending.is_empty());

        let mut pending = vec![b'a', 0xff, b'b', 0xe2, 0x82];
        assert_eq!(decode_complete(&mut pending), "a\u{fffd}b");
        assert_eq!(pending, [0xe2, 0x82]);
    }

    #[cfg(unix)]
    #[test]
    fn character_across_read_boundary() {
        let mut p =
            ExecProcess::spawn("sh", &["-c", "printf '%01023d\\303\\251 done\\n' 0"], None, &[])
                .unwrap();
        let text = p.wait_for("done", WAIT).unwrap();
        assert!(text.ends_with("0é done"));
        assert!(!text.contains(char::REPLACEMENT_CHARACTER));
    }

    #[cfg(unix)]
    #[test]
    fn returned_output_is_released() {
        let mut p = ExecProcess::spawn("cat", &[], None, &[]).unwrap();
        for i in 0..100 {
            p.write_line(&format!("step {} >", i)).unwrap();
            p.wait_for(">", WAIT).unwrap();
        }
        p.write_line("tail").unwrap();
        p.wait_for("tail", WAIT).unwrap();
        assert!(!p.output().contains("step"));
        assert_eq!(p.finish().unwrap(), Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn echoes_through_cat() {
        let mut p = ExecProcess::spawn("cat", &[], None, &[]).unwrap();
        p.write_line("run 10ns").unwrap();
        p.write_line("> ").unwrap();
        assert_eq!(p.wait_for("10ns", WAIT).unwrap(), "run 10ns");
        assert_eq!(p.wait_for(">", WAIT).unwrap(), "\n>");
        assert_eq!(p.finish().unwrap(), Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn stderr_and_environment_are_collected() {
        let script = "echo \"$SIM_NAME ready\" >&2; read cmd; echo \"got $cmd\"; exit 3";
        let mut p =
            ExecProcess::spawn("sh", &["-c", script], None, &[("SIM_NAME", "nanosim")]).unwrap();
        p.wait_for("nanosim ready", WAIT).unwrap();
        p.write_line("quit").unwrap();
        assert!(p.wait_for("got quit", WAIT).unwrap().ends_with("got quit"));
        assert!(!p.output().contains("got quit"));
        assert_eq!(p.finish().unwrap(), Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn missing_prompt() {
        let mut p = ExecProcess::spawn("sh", &["-c", "echo partial"], None, &[]).unwrap();
        assert!(matches!(p.wait_for("done", WAIT), Err(Error::Transport(_))));
        assert!(p.output().contains("partial"));

        let mut p = ExecProcess::spawn("sleep", &["5"], None, &[]).unwrap();
        assert!(matches!(
            p.wait_for("never", Duration::from_millis(50)),
            Err(Error::Transport(_))
        ));
        assert!(ExecProcess::spawn("no-such-simulator", &[], None, &[]).is_err());
    }
}
