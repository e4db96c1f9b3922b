use anyhow::{bail, Context, Result};
use log::{debug, info};
use shared::{Cancelled, InferenceConfig, ItemId, JobListener, JobSpec};
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::routine::InferenceRoutine;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STDERR_TAIL_LINES: usize = 5;

/// Runs an external separation program once per job and translates its
/// stdout into listener calls.
///
/// Recognised lines are `progress: <percent>` and `done: <path>`; anything
/// else non-empty is forwarded as a log line. Cancellation kills the child.
pub struct CommandRoutine {
    program: String,
    base_args: Vec<String>,
}

/// One line of the program's stdout.
#[derive(Debug, PartialEq)]
enum OutputLine<'a> {
    Progress(u8),
    Done(&'a str),
    Log(&'a str),
}

fn parse_line(line: &str) -> Option<OutputLine<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(value) = line.strip_prefix("progress:") {
        if let Ok(percent) = value.trim().parse::<f32>() {
            return Some(OutputLine::Progress(percent.clamp(0.0, 100.0).round() as u8));
        }
    }
    if let Some(path) = line.strip_prefix("done:") {
        let path = path.trim();
        if !path.is_empty() {
            return Some(OutputLine::Done(path));
        }
    }
    Some(OutputLine::Log(line))
}

/// Strip the line terminator and decode, replacing invalid UTF-8.
fn decode_line(buf: &[u8]) -> String {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    let buf = buf.strip_suffix(b"\r").unwrap_or(buf);
    String::from_utf8_lossy(buf).into_owned()
}

fn stop(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl CommandRoutine {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    pub fn from_config(config: &InferenceConfig) -> Self {
        Self::new(config.program(), config.args())
    }

    /// Full argument list for `job`, after the configured base arguments.
    pub fn command_args(&self, job: &JobSpec) -> Vec<OsString> {
        let options = job.options();
        let mut args: Vec<OsString> = self.base_args.iter().map(OsString::from).collect();
        args.push("--output".into());
        args.push(options.output_dir.clone().into_os_string());
        args.push("--device".into());
        args.push(options.device.as_str().into());
        args.push("--chunk-size".into());
        args.push(options.chunk_size.to_string().into());
        args.push("--overlap-large".into());
        args.push(options.overlap_large.to_string().into());
        args.push("--overlap-small".into());
        args.push(options.overlap_small.to_string().into());
        args.push("--model".into());
        args.push(options.model.as_str().into());
        if options.vocals_only {
            args.push("--vocals-only".into());
        }
        args.push("--".into());
        args.extend(job.items().iter().map(|item| item.path().as_os_str().to_owned()));
        args
    }
}

impl InferenceRoutine for CommandRoutine {
    fn run(&self, job: &JobSpec, listener: &mut dyn JobListener) -> Result<()> {
        info!("Launching {} for {} item(s)", self.program, job.items().len());
        let mut child = Command::new(&self.program)
            .args(self.command_args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to launch {}", self.program))?;

        let stdout = child.stdout.take().context("Child stdout was not captured")?;
        let mut stderr = child.stderr.take().context("Child stderr was not captured")?;

        let (line_tx, line_rx) = mpsc::channel::<io::Result<String>>();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let line = match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => Ok(decode_line(&buf)),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                let failed = line.is_err();
                if line_tx.send(line).is_err() || failed {
                    break;
                }
            }
        });
        let stderr_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        });

        // Output may end before the program does, so keep polling for
        // cancellation until it has actually exited.
        let mut stdout_open = true;
        let status = loop {
            if stdout_open {
                match line_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(Ok(line)) => match parse_line(&line) {
                        Some(OutputLine::Progress(percent)) => listener.on_progress(percent),
                        Some(OutputLine::Done(path)) => listener.on_item_done(&ItemId::from(path)),
                        Some(OutputLine::Log(text)) => listener.on_log(text),
                        None => {}
                    },
                    Ok(Err(e)) => {
                        stop(&mut child);
                        return Err(e).with_context(|| format!("Failed to read output of {}", self.program));
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => stdout_open = false,
                }
            } else {
                match child
                    .try_wait()
                    .with_context(|| format!("Failed to wait for {}", self.program))?
                {
                    Some(status) => break status,
                    None => thread::sleep(POLL_INTERVAL),
                }
            }
            if listener.is_cancelled() {
                info!("Stopping {} (pid {})", self.program, child.id());
                stop(&mut child);
                return Err(Cancelled.into());
            }
        };

        let stderr = stderr_reader.join().unwrap_or_default();
        debug!("{} exited with {}", self.program, status);

        if !status.success() {
            let tail: Vec<&str> = stderr
                .lines()
                .filter(|l| !l.trim().is_empty())
                .collect();
            let tail = tail[tail.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            if tail.is_empty() {
                bail!("{} exited with {}", self.program, status);
            }
            bail!("{} exited with {}: {}", self.program, status, tail);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{JobOptions, ModelVariant};
    use std::path::PathBuf;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        lines: Vec<String>,
        cancelled: bool,
        cancel_at: Option<Instant>,
    }

    impl JobListener for Recorder {
        fn on_progress(&mut self, percent: u8) {
            self.lines.push(format!("progress {percent}"));
        }

        fn on_item_done(&mut self, item: &ItemId) {
            self.lines.push(format!("done {item}"));
        }

        fn on_log(&mut self, message: &str) {
            self.lines.push(format!("log {message}"));
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled || self.cancel_at.is_some_and(|at| Instant::now() >= at)
        }
    }

    fn job() -> JobSpec {
        JobSpec::new(
            vec![ItemId::from("a.wav"), ItemId::from("b.wav")],
            JobOptions {
                output_dir: PathBuf::from("out"),
                model: ModelVariant::SixStem,
                vocals_only: true,
                ..JobOptions::default()
            },
        )
    }

    fn shell(script: &str) -> CommandRoutine {
        CommandRoutine::new("sh", vec!["-c".into(), script.into(), "stemsplit".into()])
    }

    #[test]
    fn parses_protocol_lines() {
        assert_eq!(parse_line("progress: 42"), Some(OutputLine::Progress(42)));
        assert_eq!(parse_line("progress: 99.6"), Some(OutputLine::Progress(100)));
        assert_eq!(parse_line("progress: 400"), Some(OutputLine::Progress(100)));
        assert_eq!(parse_line("done: /music/a.wav"), Some(OutputLine::Done("/music/a.wav")));
        assert_eq!(parse_line("progress: lots"), Some(OutputLine::Log("progress: lots")));
        assert_eq!(parse_line("  loading model  "), Some(OutputLine::Log("loading model")));
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn builds_arguments_from_options() {
        let routine = CommandRoutine::new("python", vec!["inference.py".into()]);
        let args: Vec<String> = routine
            .command_args(&job())
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "inference.py",
                "--output",
                "out",
                "--device",
                "auto",
                "--chunk-size",
                "1000000",
                "--overlap-large",
                "0.6",
                "--overlap-small",
                "0.5",
                "--model",
                "six-stem",
                "--vocals-only",
                "--",
                "a.wav",
                "b.wav",
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn forwards_program_output_in_order() {
        let routine = shell("echo 'progress: 10'; echo x; echo 'done: a.wav'; echo 'progress: 100'");
        let mut recorder = Recorder::default();
        routine.run(&job(), &mut recorder).unwrap();
        assert_eq!(
            recorder.lines,
            ["progress 10", "log x", "done a.wav", "progress 100"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn invalid_utf8_line_does_not_end_output() {
        let routine = shell(r"printf 'progress: 10\n\377 caf\351\r\ndone: a.wav\nprogress: 100\n'");
        let mut recorder = Recorder::default();
        routine.run(&job(), &mut recorder).unwrap();
        assert_eq!(
            recorder.lines,
            [
                "progress 10",
                "log \u{FFFD} caf\u{FFFD}",
                "done a.wav",
                "progress 100",
            ]
        );
    }

    #[test]
    fn decodes_lines_lossily() {
        assert_eq!(decode_line(b"progress: 5\r\n"), "progress: 5");
        assert_eq!(decode_line(b"caf\xe9\n"), "caf\u{FFFD}");
        assert_eq!(decode_line(b"no newline"), "no newline");
    }

    #[cfg(unix)]
    #[test]
    fn failure_includes_stderr_tail() {
        let routine = shell("echo 'model not found' >&2; exit 3");
        let err = routine.run(&job(), &mut Recorder::default()).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("model not found"), "{message}");
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_the_child() {
        let routine = shell("sleep 30");
        let mut recorder = Recorder {
            cancelled: true,
            ..Recorder::default()
        };
        let started = std::time::Instant::now();
        let err = routine.run(&job(), &mut recorder).unwrap_err();
        assert!(err.is::<Cancelled>());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_after_stdout_closes_kills_the_child() {
        // The program closes stdout right away and keeps running.
        let routine = shell("exec >&-; sleep 5");
        let mut recorder = Recorder {
            cancel_at: Some(Instant::now() + Duration::from_millis(300)),
            ..Recorder::default()
        };
        let started = Instant::now();
        let err = routine.run(&job(), &mut recorder).unwrap_err();
        assert!(err.is::<Cancelled>());
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[test]
    fn missing_program_is_an_error() {
        let routine = CommandRoutine::new("stemsplit-no-such-program", Vec::new());
        assert!(routine.run(&job(), &mut Recorder::default()).is_err());
    }
}
