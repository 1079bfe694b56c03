use super::{types::*, Engine};
use crate::config::Config;
use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Runs an external converter program once per document.
///
/// `<program> <args..> convert` receives the document on stdin and prints a
/// single [`ConvertOut`] JSON object; `<program> <args..> doctor` prints an
/// [`EngineDiag`].
pub struct CommandEngine {
    cfg: Config,
    program: PathBuf,
}

impl CommandEngine {
    pub fn new(cfg: &Config) -> Result<Self> {
        let raw = cfg.engine.program.trim();
        if raw.is_empty() {
            return Err(anyhow!("engine.program is empty"));
        }
        for arg in &cfg.engine.args {
            if arg.ends_with(".py") && !PathBuf::from(arg).exists() {
                return Err(anyhow!("missing converter script: {arg}"));
            }
        }
        Ok(Self {
            cfg: cfg.clone(),
            program: expand_tilde(raw),
        })
    }

    fn timeout(&self) -> Option<Duration> {
        (self.cfg.engine.timeout_seconds > 0)
            .then(|| Duration::from_secs(self.cfg.engine.timeout_seconds))
    }

    fn run_json<O: for<'de> serde::Deserialize<'de>>(
        &self,
        cmd_name: &str,
        stdin_bytes: &[u8],
        timeout: Option<Duration>,
    ) -> Result<O> {
        debug!(
            "engine run {} {} timeout={:?}",
            self.program.display(),
            cmd_name,
            timeout
        );
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.cfg.engine.args);
        cmd.arg(cmd_name);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        for (k, v) in &self.cfg.engine.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning converter: {}", self.program.display()))?;

        // Feed stdin from its own thread so a chatty converter cannot block on
        // a full stdout pipe while we are still writing the document.
        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
        let (output, written) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || -> std::io::Result<()> {
                stdin.write_all(stdin_bytes)?;
                stdin.flush()
            });
            let output = match timeout {
                Some(limit) => wait_with_timeout(&mut child, limit),
                None => child
                    .wait_with_output()
                    .with_context(|| "waiting for converter"),
            };
            (output, writer.join())
        });
        let output = output?;

        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("converter closed stdin early");
            }
            Ok(Err(err)) => return Err(anyhow!("writing document to converter: {err}")),
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "converter {} exited with {}\n{}",
                cmd_name,
                output.status,
                stderr.trim()
            ));
        }

        if !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("converter stderr: {}", stderr.trim());
        }

        let out: O = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parsing converter JSON output ({cmd_name})"))?;
        Ok(out)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

impl Engine for CommandEngine {
    fn doctor(&self) -> Result<EngineDiag> {
        self.run_json("doctor", &[], Some(Duration::from_secs(120)))
    }

    fn convert(&self, document: &[u8]) -> Result<Conversion> {
        let out: ConvertOut = self.run_json("convert", document, self.timeout())?;
        if !out.ok {
            let msg = out
                .error
                .unwrap_or_else(|| "converter reported ok=false".to_string());
            warn!("converter returned ok=false: {msg}");
            return Err(anyhow!(msg));
        }
        Ok(Conversion {
            markdown: out.markdown,
            metadata: out.metadata,
        })
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Output> {
    // Drain pipes while waiting so verbose converter logging can't deadlock the
    // child on a full stdout/stderr buffer.
    let stdout_reader = child.stdout.take();
    let stderr_reader = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout_reader {
            out.read_to_end(&mut buf).with_context(|| "read stdout")?;
        }
        Ok(buf)
    });

    let stderr_thread = std::thread::spawn(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr_reader {
            err.read_to_end(&mut buf).with_context(|| "read stderr")?;
        }
        Ok(buf)
    });

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().with_context(|| "try_wait")? {
            let stdout = stdout_thread
                .join()
                .map_err(|_| anyhow!("stdout reader thread panicked"))??;
            let stderr = stderr_thread
                .join()
                .map_err(|_| anyhow!("stderr reader thread panicked"))??;
            return Ok(Output {
                status,
                stdout,
                stderr,
            });
        }

        if start.elapsed() > timeout {
            warn!("converter timed out after {:?}", timeout);
            let _ = child.kill();
            child.wait().with_context(|| "wait after kill")?;
            let stderr = stderr_thread
                .join()
                .map_err(|_| anyhow!("stderr reader thread panicked"))??;
            let _ = stdout_thread.join();
            return Err(anyhow!(
                "converter exceeded timeout ({:?}); stderr: {}",
                timeout,
                String::from_utf8_lossy(&stderr)
            ));
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}
